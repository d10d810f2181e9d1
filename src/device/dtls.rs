//! DTLS-PSK driver.
//!
//! Long-lived UDP+DTLS session for controllers that only accept an
//! encrypted stream (Hue Entertainment class hardware). The cipher list
//! is pinned to `PSK-AES128-GCM-SHA256`; a missing cipher is a
//! configuration error, not a transport one. Handshakes run a bounded
//! attempt budget with fixed spacing, and any write failure tears the
//! session down for the dispatcher to rebuild after its cooldown.

use std::io::{Read, Write};
use std::net::UdpSocket;
use std::time::Duration;

use log::{debug, info};
use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslStream, SslVerifyMode};
use serde_json::Value;

use crate::image::ColorRgb;

use super::{DeviceError, DeviceResult, LedDriver};

const CIPHER_LIST: &str = "PSK-AES128-GCM-SHA256";
/// Spacing between handshake attempts.
const HANDSHAKE_SPACING: Duration = Duration::from_millis(200);

/// Blocking adapter: DTLS records over a connected UDP socket.
#[derive(Debug)]
struct UdpChannel {
    socket: UdpSocket,
}

impl Read for UdpChannel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.socket.recv(buf)
    }
}

impl Write for UdpChannel {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.socket.send(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct DtlsDriver {
    host: String,
    ssl_port: u16,
    psk_hex: String,
    psk_identity: String,
    handshake_attempts: u32,
    led_count: usize,
    stream: Option<SslStream<UdpChannel>>,
}

impl DtlsDriver {
    pub fn new() -> Self {
        Self {
            host: String::new(),
            ssl_port: 2100,
            psk_hex: String::new(),
            psk_identity: String::new(),
            handshake_attempts: 5,
            led_count: 0,
            stream: None,
        }
    }

    fn build_context(&self) -> DeviceResult<SslContext> {
        let mut builder = SslContextBuilder::new(SslMethod::dtls())
            .map_err(|e| DeviceError::Io(e.to_string()))?;

        builder.set_cipher_list(CIPHER_LIST).map_err(|_| {
            DeviceError::Config(format!(
                "missing cipher {CIPHER_LIST}; OpenSSL 1.1.1 or newer required"
            ))
        })?;
        builder.set_verify(SslVerifyMode::NONE);

        let psk = hex::decode(&self.psk_hex)
            .map_err(|_| DeviceError::Config("PSK is not valid hex".to_string()))?;
        let identity = self.psk_identity.clone();
        builder.set_psk_client_callback(move |_ssl, _hint, identity_buf, psk_buf| {
            debug!("server requested our PSK identity");
            let id = identity.as_bytes();
            let id_len = id.len().min(identity_buf.len().saturating_sub(1));
            identity_buf[..id_len].copy_from_slice(&id[..id_len]);
            identity_buf[id_len] = 0;
            let key_len = psk.len().min(psk_buf.len());
            psk_buf[..key_len].copy_from_slice(&psk[..key_len]);
            Ok(key_len)
        });

        Ok(builder.build())
    }

    fn connect_once(&self, ctx: &SslContext) -> DeviceResult<SslStream<UdpChannel>> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect((self.host.as_str(), self.ssl_port))?;
        socket.set_read_timeout(Some(HANDSHAKE_SPACING))?;

        let ssl = Ssl::new(ctx).map_err(|e| DeviceError::Io(e.to_string()))?;
        let channel = UdpChannel { socket };
        match ssl.connect(channel) {
            Ok(stream) => Ok(stream),
            Err(err) => Err(DeviceError::Io(format!("handshake failed: {err}"))),
        }
    }

    fn establish(&mut self) -> DeviceResult<()> {
        let ctx = self.build_context()?;
        let mut last_error = None;
        for attempt in 1..=self.handshake_attempts {
            debug!(
                "DTLS handshake attempt {}/{}",
                attempt, self.handshake_attempts
            );
            match self.connect_once(&ctx) {
                Ok(mut stream) => {
                    // Steady-state writes must not stall the dispatcher.
                    stream
                        .get_mut()
                        .socket
                        .set_read_timeout(Some(Duration::from_millis(500)))?;
                    info!("established encrypted connection to {}", self.host);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) => {
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| DeviceError::Io("handshake attempts exhausted".to_string())))
    }
}

impl Default for DtlsDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LedDriver for DtlsDriver {
    fn name(&self) -> &str {
        "dtls"
    }

    fn init(&mut self, config: &Value) -> DeviceResult<()> {
        self.host = config["host"]
            .as_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DeviceError::Config("no target host".to_string()))?
            .to_string();

        let port = config["sslport"].as_i64().unwrap_or(2100);
        if !(1..=65535).contains(&port) {
            return Err(DeviceError::Config(format!("invalid target port {port}")));
        }
        self.ssl_port = port as u16;

        self.psk_hex = config["psk"].as_str().unwrap_or_default().to_string();
        self.psk_identity = config["psk_identity"].as_str().unwrap_or_default().to_string();
        self.handshake_attempts = config["hs_attempts"].as_u64().unwrap_or(5) as u32;
        self.led_count = config["currentLedCount"].as_u64().unwrap_or(1) as usize;

        if self.psk_hex.is_empty() || self.psk_identity.is_empty() {
            return Err(DeviceError::Config(
                "PSK and PSK identity are required".to_string(),
            ));
        }

        debug!(
            "DTLS init: {}:{} identity '{}', {} handshake attempts",
            self.host, self.ssl_port, self.psk_identity, self.handshake_attempts
        );
        Ok(())
    }

    fn open(&mut self) -> DeviceResult<()> {
        self.establish()
    }

    fn close(&mut self) -> DeviceResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown();
        }
        Ok(())
    }

    fn write(&mut self, values: &[ColorRgb]) -> DeviceResult<()> {
        let stream = self.stream.as_mut().ok_or(DeviceError::NotReady)?;

        let mut payload = Vec::with_capacity(values.len() * 3);
        for c in values {
            payload.extend_from_slice(&[c.red, c.green, c.blue]);
        }

        if let Err(err) = stream.write_all(&payload) {
            // Session is gone; drop it so the dispatcher's cooldown
            // path rebuilds from a clean handshake.
            self.stream = None;
            return Err(DeviceError::Io(format!("encrypted write failed: {err}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn init_requires_credentials() {
        let mut d = DtlsDriver::new();
        let err = d
            .init(&json!({ "host": "10.0.0.9" }))
            .unwrap_err();
        assert!(matches!(err, DeviceError::Config(_)));
    }

    #[test]
    fn init_validates_port_range() {
        let mut d = DtlsDriver::new();
        let err = d
            .init(&json!({
                "host": "10.0.0.9",
                "sslport": 0,
                "psk": "aabb",
                "psk_identity": "bridge-user",
            }))
            .unwrap_err();
        assert!(matches!(err, DeviceError::Config(_)));
    }

    #[test]
    fn psk_must_be_hex() {
        let mut d = DtlsDriver::new();
        d.init(&json!({
            "host": "10.0.0.9",
            "psk": "not-hex!",
            "psk_identity": "bridge-user",
        }))
        .unwrap();
        // The malformed key surfaces when the context is built.
        assert!(matches!(
            d.build_context().unwrap_err(),
            DeviceError::Config(_)
        ));
    }

    #[test]
    fn context_pins_the_psk_cipher() {
        let mut d = DtlsDriver::new();
        d.init(&json!({
            "host": "10.0.0.9",
            "psk": "00112233445566778899aabbccddeeff",
            "psk_identity": "bridge-user",
        }))
        .unwrap();
        // Succeeds on any OpenSSL with PSK support.
        d.build_context().unwrap();
    }

    #[test]
    fn write_without_session_is_not_ready() {
        let mut d = DtlsDriver::new();
        assert!(matches!(
            d.write(&[ColorRgb::BLACK]),
            Err(DeviceError::NotReady)
        ));
    }
}
