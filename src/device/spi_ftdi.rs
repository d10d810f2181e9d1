//! SPI driver over FTDI MPSSE bridges.
//!
//! Two vendor stacks exist in the wild (`ftd2xx` and `libftdi1`); both
//! are loaded dynamically at open time and hidden behind one backend
//! trait, whichever library resolves first wins. The MPSSE engine is
//! configured for SPI with a 30 MHz base clock; each frame is a
//! chip-select-framed `0x11` clocked write.

#![allow(non_camel_case_types)]

use std::ffi::c_void;
use std::os::raw::{c_int, c_uchar, c_uint};

use log::{debug, info};
use once_cell::sync::OnceCell;
use serde_json::Value;

use crate::image::ColorRgb;

use super::{DeviceError, DeviceResult, LedDriver};

const MPSSE_BASE_CLOCK_HZ: u32 = 30_000_000;
const DEFAULT_RATE_HZ: u32 = 4_000_000;
/// GPIO levels with chip select high / low (CS on ADBUS3).
const PINS_CS_HIGH: u8 = 0x08;
const PINS_CS_LOW: u8 = 0x00;
/// SCK, MOSI, CS as outputs.
const PIN_DIRECTIONS: u8 = 0x08 | 0x02 | 0x01;

/// MPSSE clock divisor for a requested rate.
pub(crate) fn spi_divisor(rate_hz: u32) -> u16 {
    let rate = rate_hz.max(1) as f64;
    (((MPSSE_BASE_CLOCK_HZ as f64 - rate) / rate).ceil() as i64 & 0xFFFF) as u16
}

/// Rate the divisor actually produces.
pub(crate) fn realized_rate(rate_hz: u32) -> u32 {
    let divisor = spi_divisor(rate_hz) as u32;
    (MPSSE_BASE_CLOCK_HZ as f64 / (1 + divisor) as f64).ceil() as u32
}

/// MPSSE initialization: fixed clocking options, divisor, idle pin state.
pub(crate) fn mpsse_setup(rate_hz: u32) -> Vec<u8> {
    let divisor = spi_divisor(rate_hz);
    vec![
        0x8A, // disable clock divide-by-5
        0x97, // disable adaptive clocking
        0x8D, // disable three-phase clocking
        0x86, // set divisor
        (divisor & 0xFF) as u8,
        (divisor >> 8) as u8,
        0x80, // pin state: CS high, all SPI pins as outputs
        PINS_CS_HIGH,
        PIN_DIRECTIONS,
    ]
}

/// One SPI frame: CS low, clocked byte write (`0x11`, length minus one,
/// little-endian), payload, CS high.
pub(crate) fn mpsse_frame(payload: &[u8]) -> Vec<u8> {
    let size = payload.len().max(1) - 1;
    let mut out = Vec::with_capacity(payload.len() + 9);
    out.extend_from_slice(&[0x80, PINS_CS_LOW, PIN_DIRECTIONS]);
    out.extend_from_slice(&[0x11, (size & 0xFF) as u8, ((size >> 8) & 0xFF) as u8]);
    out.extend_from_slice(payload);
    out.extend_from_slice(&[0x80, PINS_CS_HIGH, PIN_DIRECTIONS]);
    out
}

trait FtdiBackend: Send {
    fn open(&mut self, device: &str, rate_hz: u32) -> DeviceResult<()>;
    fn write(&mut self, data: &[u8]) -> DeviceResult<()>;
    fn close(&mut self);
    fn backend_name(&self) -> &'static str;
}

// --- ftd2xx ---------------------------------------------------------

type FT_HANDLE = *mut c_void;
type FT_STATUS = c_uint;
const FT_OK: FT_STATUS = 0;
const FT_OPEN_BY_LOCATION: c_uint = 4;

type fn_FT_OpenEx = unsafe extern "C" fn(*mut c_void, c_uint, *mut FT_HANDLE) -> FT_STATUS;
type fn_FT_Close = unsafe extern "C" fn(FT_HANDLE) -> FT_STATUS;
type fn_FT_Write = unsafe extern "C" fn(FT_HANDLE, *const c_uchar, c_uint, *mut c_uint) -> FT_STATUS;
type fn_FT_ResetDevice = unsafe extern "C" fn(FT_HANDLE) -> FT_STATUS;
type fn_FT_SetBaudRate = unsafe extern "C" fn(FT_HANDLE, c_uint) -> FT_STATUS;
type fn_FT_SetUSBParameters = unsafe extern "C" fn(FT_HANDLE, c_uint, c_uint) -> FT_STATUS;
type fn_FT_SetChars = unsafe extern "C" fn(FT_HANDLE, c_uchar, c_uchar, c_uchar, c_uchar) -> FT_STATUS;
type fn_FT_SetLatencyTimer = unsafe extern "C" fn(FT_HANDLE, c_uchar) -> FT_STATUS;
type fn_FT_SetFlowControl = unsafe extern "C" fn(FT_HANDLE, c_uint, c_uchar, c_uchar) -> FT_STATUS;
type fn_FT_SetBitMode = unsafe extern "C" fn(FT_HANDLE, c_uchar, c_uchar) -> FT_STATUS;

struct Ftd2xxApi {
    ft_open_ex: fn_FT_OpenEx,
    ft_close: fn_FT_Close,
    ft_write: fn_FT_Write,
    ft_reset_device: fn_FT_ResetDevice,
    ft_set_baud_rate: fn_FT_SetBaudRate,
    ft_set_usb_parameters: fn_FT_SetUSBParameters,
    ft_set_chars: fn_FT_SetChars,
    ft_set_latency_timer: fn_FT_SetLatencyTimer,
    ft_set_flow_control: fn_FT_SetFlowControl,
    ft_set_bit_mode: fn_FT_SetBitMode,
}

impl Ftd2xxApi {
    fn get() -> Result<&'static Self, libloading::Error> {
        static CELL: OnceCell<Ftd2xxApi> = OnceCell::new();
        CELL.get_or_try_init(|| unsafe {
            #[cfg(windows)]
            let lib = libloading::Library::new("ftd2xx.dll")?;
            #[cfg(not(windows))]
            let lib = libloading::Library::new("libftd2xx.so")?;

            let api = Ftd2xxApi {
                ft_open_ex: *lib.get(b"FT_OpenEx\0")?,
                ft_close: *lib.get(b"FT_Close\0")?,
                ft_write: *lib.get(b"FT_Write\0")?,
                ft_reset_device: *lib.get(b"FT_ResetDevice\0")?,
                ft_set_baud_rate: *lib.get(b"FT_SetBaudRate\0")?,
                ft_set_usb_parameters: *lib.get(b"FT_SetUSBParameters\0")?,
                ft_set_chars: *lib.get(b"FT_SetChars\0")?,
                ft_set_latency_timer: *lib.get(b"FT_SetLatencyTimer\0")?,
                ft_set_flow_control: *lib.get(b"FT_SetFlowControl\0")?,
                ft_set_bit_mode: *lib.get(b"FT_SetBitMode\0")?,
            };
            // The library stays resident for the process lifetime.
            std::mem::forget(lib);
            Ok(api)
        })
    }
}

struct Ftd2xxBackend {
    api: &'static Ftd2xxApi,
    handle: FT_HANDLE,
}

// The raw handle never leaves the dispatcher thread.
unsafe impl Send for Ftd2xxBackend {}

impl Ftd2xxBackend {
    fn load() -> Option<Self> {
        Ftd2xxApi::get().ok().map(|api| Self {
            api,
            handle: std::ptr::null_mut(),
        })
    }

    fn check(status: FT_STATUS, what: &str) -> DeviceResult<()> {
        if status != FT_OK {
            return Err(DeviceError::Io(format!("{what} failed (FT_STATUS {status})")));
        }
        Ok(())
    }
}

impl FtdiBackend for Ftd2xxBackend {
    fn backend_name(&self) -> &'static str {
        "ftd2xx"
    }

    fn open(&mut self, device: &str, rate_hz: u32) -> DeviceResult<()> {
        let location: i64 = device
            .parse()
            .map_err(|_| DeviceError::Config("FTDI device name must be a location number".to_string()))?;

        unsafe {
            let mut handle: FT_HANDLE = std::ptr::null_mut();
            Self::check(
                (self.api.ft_open_ex)(location as *mut c_void, FT_OPEN_BY_LOCATION, &mut handle),
                "FT_OpenEx",
            )?;
            self.handle = handle;

            let setup = || -> DeviceResult<()> {
                Self::check((self.api.ft_reset_device)(self.handle), "FT_ResetDevice")?;
                Self::check(
                    (self.api.ft_set_baud_rate)(self.handle, DEFAULT_RATE_HZ),
                    "FT_SetBaudRate",
                )?;
                Self::check(
                    (self.api.ft_set_usb_parameters)(self.handle, 65536, 65535),
                    "FT_SetUSBParameters",
                )?;
                Self::check(
                    (self.api.ft_set_chars)(self.handle, 0, 0, 0, 0),
                    "FT_SetChars",
                )?;
                Self::check(
                    (self.api.ft_set_latency_timer)(self.handle, 1),
                    "FT_SetLatencyTimer",
                )?;
                Self::check(
                    (self.api.ft_set_flow_control)(self.handle, 0, 0, 0),
                    "FT_SetFlowControl",
                )?;
                Self::check((self.api.ft_set_bit_mode)(self.handle, 0x00, 0x00), "FT_SetBitMode")?;
                Self::check(
                    (self.api.ft_set_bit_mode)(self.handle, 0xFF, 0x02),
                    "FT_SetBitMode MPSSE",
                )?;
                Ok(())
            };
            if let Err(err) = setup() {
                (self.api.ft_close)(self.handle);
                self.handle = std::ptr::null_mut();
                return Err(err);
            }
        }

        self.write(&mpsse_setup(rate_hz))
    }

    fn write(&mut self, data: &[u8]) -> DeviceResult<()> {
        if self.handle.is_null() {
            return Err(DeviceError::NotReady);
        }
        unsafe {
            let mut sent: c_uint = 0;
            Self::check(
                (self.api.ft_write)(self.handle, data.as_ptr(), data.len() as c_uint, &mut sent),
                "FT_Write",
            )?;
            if sent as usize != data.len() {
                return Err(DeviceError::Io("short FTDI write".to_string()));
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.handle.is_null() {
            unsafe {
                (self.api.ft_close)(self.handle);
            }
            self.handle = std::ptr::null_mut();
        }
    }
}

// --- libftdi1 -------------------------------------------------------

type fn_ftdi_new = unsafe extern "C" fn() -> *mut c_void;
type fn_ftdi_free = unsafe extern "C" fn(*mut c_void);
type fn_ftdi_usb_open = unsafe extern "C" fn(*mut c_void, c_int, c_int) -> c_int;
type fn_ftdi_usb_close = unsafe extern "C" fn(*mut c_void) -> c_int;
type fn_ftdi_usb_reset = unsafe extern "C" fn(*mut c_void) -> c_int;
type fn_ftdi_set_latency_timer = unsafe extern "C" fn(*mut c_void, c_uchar) -> c_int;
type fn_ftdi_set_bitmode = unsafe extern "C" fn(*mut c_void, c_uchar, c_uchar) -> c_int;
type fn_ftdi_write_data = unsafe extern "C" fn(*mut c_void, *const c_uchar, c_int) -> c_int;

struct LibFtdiApi {
    ftdi_new: fn_ftdi_new,
    ftdi_free: fn_ftdi_free,
    ftdi_usb_open: fn_ftdi_usb_open,
    ftdi_usb_close: fn_ftdi_usb_close,
    ftdi_usb_reset: fn_ftdi_usb_reset,
    ftdi_set_latency_timer: fn_ftdi_set_latency_timer,
    ftdi_set_bitmode: fn_ftdi_set_bitmode,
    ftdi_write_data: fn_ftdi_write_data,
}

impl LibFtdiApi {
    fn get() -> Result<&'static Self, libloading::Error> {
        static CELL: OnceCell<LibFtdiApi> = OnceCell::new();
        CELL.get_or_try_init(|| unsafe {
            #[cfg(windows)]
            let lib = libloading::Library::new("libftdi1.dll")?;
            #[cfg(not(windows))]
            let lib = libloading::Library::new("libftdi1.so.2")
                .or_else(|_| libloading::Library::new("libftdi1.so"))?;

            let api = LibFtdiApi {
                ftdi_new: *lib.get(b"ftdi_new\0")?,
                ftdi_free: *lib.get(b"ftdi_free\0")?,
                ftdi_usb_open: *lib.get(b"ftdi_usb_open\0")?,
                ftdi_usb_close: *lib.get(b"ftdi_usb_close\0")?,
                ftdi_usb_reset: *lib.get(b"ftdi_usb_reset\0")?,
                ftdi_set_latency_timer: *lib.get(b"ftdi_set_latency_timer\0")?,
                ftdi_set_bitmode: *lib.get(b"ftdi_set_bitmode\0")?,
                ftdi_write_data: *lib.get(b"ftdi_write_data\0")?,
            };
            std::mem::forget(lib);
            Ok(api)
        })
    }
}

struct LibFtdiBackend {
    api: &'static LibFtdiApi,
    ctx: *mut c_void,
    vid: i32,
    pid: i32,
}

// The context pointer never leaves the dispatcher thread.
unsafe impl Send for LibFtdiBackend {}

impl LibFtdiBackend {
    fn load(vid: i32, pid: i32) -> Option<Self> {
        LibFtdiApi::get().ok().map(|api| Self {
            api,
            ctx: std::ptr::null_mut(),
            vid,
            pid,
        })
    }

    fn check(rc: c_int, what: &str) -> DeviceResult<()> {
        if rc < 0 {
            return Err(DeviceError::Io(format!("{what} failed (rc {rc})")));
        }
        Ok(())
    }
}

impl FtdiBackend for LibFtdiBackend {
    fn backend_name(&self) -> &'static str {
        "libftdi1"
    }

    fn open(&mut self, _device: &str, rate_hz: u32) -> DeviceResult<()> {
        unsafe {
            let ctx = (self.api.ftdi_new)();
            if ctx.is_null() {
                return Err(DeviceError::Io("ftdi_new failed".to_string()));
            }
            self.ctx = ctx;

            let setup = || -> DeviceResult<()> {
                Self::check((self.api.ftdi_usb_open)(ctx, self.vid, self.pid), "ftdi_usb_open")?;
                Self::check((self.api.ftdi_usb_reset)(ctx), "ftdi_usb_reset")?;
                Self::check(
                    (self.api.ftdi_set_latency_timer)(ctx, 1),
                    "ftdi_set_latency_timer",
                )?;
                Self::check((self.api.ftdi_set_bitmode)(ctx, 0x00, 0x00), "ftdi_set_bitmode")?;
                Self::check(
                    (self.api.ftdi_set_bitmode)(ctx, 0xFF, 0x02),
                    "ftdi_set_bitmode MPSSE",
                )?;
                Ok(())
            };
            if let Err(err) = setup() {
                (self.api.ftdi_free)(ctx);
                self.ctx = std::ptr::null_mut();
                return Err(err);
            }
        }

        self.write(&mpsse_setup(rate_hz))
    }

    fn write(&mut self, data: &[u8]) -> DeviceResult<()> {
        if self.ctx.is_null() {
            return Err(DeviceError::NotReady);
        }
        unsafe {
            let rc = (self.api.ftdi_write_data)(self.ctx, data.as_ptr(), data.len() as c_int);
            Self::check(rc, "ftdi_write_data")?;
            if rc as usize != data.len() {
                return Err(DeviceError::Io("short FTDI write".to_string()));
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.ctx.is_null() {
            unsafe {
                (self.api.ftdi_usb_close)(self.ctx);
                (self.api.ftdi_free)(self.ctx);
            }
            self.ctx = std::ptr::null_mut();
        }
    }
}

// --- driver ---------------------------------------------------------

pub struct SpiFtdiDriver {
    device_name: String,
    rate_hz: u32,
    vid: i32,
    pid: i32,
    backend: Option<Box<dyn FtdiBackend>>,
}

impl SpiFtdiDriver {
    pub fn new() -> Self {
        Self {
            device_name: String::new(),
            rate_hz: DEFAULT_RATE_HZ,
            vid: 0x0403,
            pid: 0x6010,
            backend: None,
        }
    }
}

impl Default for SpiFtdiDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LedDriver for SpiFtdiDriver {
    fn name(&self) -> &str {
        "spi_ftdi"
    }

    fn init(&mut self, config: &Value) -> DeviceResult<()> {
        self.device_name = config["output"].as_str().unwrap_or("0").to_string();
        self.rate_hz = config["rate"].as_u64().unwrap_or(DEFAULT_RATE_HZ as u64) as u32;
        self.vid = config["vid"].as_i64().unwrap_or(0x0403) as i32;
        self.pid = config["pid"].as_i64().unwrap_or(0x6010) as i32;

        debug!(
            "FTDI SPI init: device '{}', rate {} Hz (realized {} Hz)",
            self.device_name,
            self.rate_hz,
            realized_rate(self.rate_hz)
        );
        Ok(())
    }

    fn open(&mut self) -> DeviceResult<()> {
        let mut backend: Box<dyn FtdiBackend> = match Ftd2xxBackend::load() {
            Some(b) => Box::new(b),
            None => match LibFtdiBackend::load(self.vid, self.pid) {
                Some(b) => Box::new(b),
                None => {
                    return Err(DeviceError::Config(
                        "neither ftd2xx nor libftdi1 could be loaded".to_string(),
                    ))
                }
            },
        };

        backend.open(&self.device_name, self.rate_hz)?;
        info!(
            "FTDI MPSSE ready via {} at {} Hz",
            backend.backend_name(),
            realized_rate(self.rate_hz)
        );
        self.backend = Some(backend);
        Ok(())
    }

    fn close(&mut self) -> DeviceResult<()> {
        if let Some(mut backend) = self.backend.take() {
            backend.close();
        }
        Ok(())
    }

    fn write(&mut self, values: &[ColorRgb]) -> DeviceResult<()> {
        let backend = self.backend.as_mut().ok_or(DeviceError::NotReady)?;
        let mut payload = Vec::with_capacity(values.len() * 3);
        for c in values {
            payload.extend_from_slice(&[c.red, c.green, c.blue]);
        }
        backend.write(&mpsse_frame(&payload))
    }

    fn latch_time_ms(&self) -> u64 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_matches_reference_formula() {
        for rate in [100_000u32, 1_000_000, 4_000_000, 15_000_000, 30_000_000] {
            let divisor =
                ((30_000_000f64 - rate as f64) / rate as f64).ceil() as u32 & 0xFFFF;
            assert_eq!(spi_divisor(rate) as u32, divisor, "rate {rate}");
            assert_eq!(
                realized_rate(rate),
                (30_000_000f64 / (1 + divisor) as f64).ceil() as u32,
                "rate {rate}"
            );
        }
    }

    #[test]
    fn four_megahertz_realizes_at_3_75() {
        // divisor = ceil(26e6 / 4e6) = 7 -> 30 MHz / 8.
        assert_eq!(spi_divisor(4_000_000), 7);
        assert_eq!(realized_rate(4_000_000), 3_750_000);
    }

    #[test]
    fn setup_contains_divisor_command() {
        let setup = mpsse_setup(4_000_000);
        let pos = setup.iter().position(|&b| b == 0x86).unwrap();
        assert_eq!(setup[pos + 1], 7);
        assert_eq!(setup[pos + 2], 0);
    }

    #[test]
    fn frame_is_cs_wrapped_with_length_prefix() {
        let payload = [1u8, 2, 3, 4, 5];
        let framed = mpsse_frame(&payload);

        // CS low.
        assert_eq!(&framed[..3], &[0x80, PINS_CS_LOW, PIN_DIRECTIONS]);
        // Clocked write of 5 bytes: size-1 = 4, little-endian.
        assert_eq!(&framed[3..6], &[0x11, 0x04, 0x00]);
        assert_eq!(&framed[6..11], &payload);
        // CS high.
        assert_eq!(&framed[11..], &[0x80, PINS_CS_HIGH, PIN_DIRECTIONS]);
    }

    #[test]
    fn frame_length_uses_two_bytes() {
        let payload = vec![0u8; 0x1234];
        let framed = mpsse_frame(&payload);
        // size-1 = 0x1233.
        assert_eq!(&framed[3..6], &[0x11, 0x33, 0x12]);
    }
}
