//! Embedded controller access
//!
//! Named firmware-method calls against the bound VPC device, plus raw EC
//! register access. Backends are synchronous; every call is moved onto
//! tokio's blocking pool so a wedged firmware call never stalls the
//! serializer worker.

use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};
use vpc_error::{Result, VpcError};
use vpc_protocol::EcWidth;

use crate::constants::firmware::{AE_NOT_FOUND, EC_READ_METHOD, EC_WRITE_METHOD, METHOD_NAME_MAX};

/// Firmware backend able to evaluate methods on an ACPI device
#[cfg_attr(test, mockall::automock)]
pub trait Firmware: Send + Sync {
    /// Evaluate `device.method(args...)` and return its integer result
    fn evaluate(&self, device: &str, method: &str, args: &[u32]) -> Result<u32>;

    fn read_ec(&self, device: &str, offset: u8) -> Result<u8> {
        read_ec_by_method(self, device, offset)
    }

    fn write_ec(&self, device: &str, offset: u8, value: u8) -> Result<()> {
        write_ec_by_method(self, device, offset, value)
    }
}

/// Read an EC byte through the RE1B firmware method
pub fn read_ec_by_method<F: Firmware + ?Sized>(firmware: &F, device: &str, offset: u8) -> Result<u8> {
    let raw = firmware.evaluate(device, EC_READ_METHOD, &[u32::from(offset)])?;
    u8::try_from(raw).map_err(|_| {
        VpcError::evaluation(EC_READ_METHOD, format!("result 0x{:x} does not fit a byte", raw))
    })
}

/// Write an EC byte through the WE1B firmware method
pub fn write_ec_by_method<F: Firmware + ?Sized>(
    firmware: &F,
    device: &str,
    offset: u8,
    value: u8,
) -> Result<()> {
    firmware
        .evaluate(device, EC_WRITE_METHOD, &[u32::from(offset), u32::from(value)])
        .map(|_| ())
}

/// Reject names firmware can never export
pub fn validate_method_name(method: &str) -> Result<()> {
    let valid = !method.is_empty()
        && method.len() <= METHOD_NAME_MAX
        && !method.starts_with(|c: char| c.is_ascii_digit())
        && method.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(VpcError::method_missing(method))
    }
}

/// Bound VPC device: its ACPI path and the backend that reaches it
#[derive(Clone)]
pub struct DeviceHandle {
    path: String,
    firmware: Arc<dyn Firmware>,
}

impl DeviceHandle {
    pub fn new(path: impl Into<String>, firmware: Arc<dyn Firmware>) -> Self {
        Self { path: path.into(), firmware }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle").field("path", &self.path).finish_non_exhaustive()
    }
}

/// EC access layer. Owned by the registry; only used from inside a turn.
#[derive(Debug, Default)]
pub struct EcAccess {
    handle: Option<DeviceHandle>,
}

impl EcAccess {
    pub fn new(handle: DeviceHandle) -> Self {
        Self { handle: Some(handle) }
    }

    pub fn is_bound(&self) -> bool {
        self.handle.is_some()
    }

    pub fn device_path(&self) -> Option<&str> {
        self.handle.as_ref().map(DeviceHandle::path)
    }

    pub fn bind(&mut self, handle: DeviceHandle) {
        self.handle = Some(handle);
    }

    pub fn unbind(&mut self) -> Option<DeviceHandle> {
        self.handle.take()
    }

    /// Evaluate a firmware method. No retries; failures propagate as-is.
    pub async fn evaluate(&self, method: &str, args: &[u32]) -> Result<u32> {
        validate_method_name(method)?;
        let name = method.to_string();
        let owned = args.to_vec();
        let result = self
            .blocking(method, move |firmware, device| firmware.evaluate(device, &name, &owned))
            .await;
        match &result {
            Ok(value) => debug!("EC {}({:x?}) -> 0x{:x}", method, args, value),
            Err(e) => debug!("EC {}({:x?}) failed: {}", method, args, e),
        }
        result
    }

    pub async fn read_byte(&self, offset: u8) -> Result<u8> {
        self.blocking(EC_READ_METHOD, move |firmware, device| firmware.read_ec(device, offset))
            .await
    }

    pub async fn write_byte(&self, offset: u8, value: u8) -> Result<()> {
        self.blocking(EC_WRITE_METHOD, move |firmware, device| {
            firmware.write_ec(device, offset, value)
        })
        .await
    }

    /// Read a byte, or a little-endian word from `offset` and `offset + 1`
    pub async fn read_register(&self, offset: u8, width: EcWidth) -> Result<u16> {
        let value = match width {
            EcWidth::Byte => u16::from(self.read_byte(offset).await?),
            EcWidth::Word => {
                let next = next_offset(offset)?;
                let low = self.read_byte(offset).await?;
                let high = self.read_byte(next).await?;
                u16::from_le_bytes([low, high])
            }
        };
        debug!("EC read 0x{:02x} ({:?}) -> 0x{:x}", offset, width, value);
        Ok(value)
    }

    pub async fn write_register(&self, offset: u8, width: EcWidth, value: u16) -> Result<()> {
        let [low, high] = value.to_le_bytes();
        match width {
            EcWidth::Byte => {
                let byte = u8::try_from(value)
                    .map_err(|_| VpcError::invalid(format!("0x{:x} does not fit a byte", value)))?;
                self.write_byte(offset, byte).await?;
            }
            EcWidth::Word => {
                let next = next_offset(offset)?;
                self.write_byte(offset, low).await?;
                self.write_byte(next, high).await?;
            }
        }
        debug!("EC write 0x{:02x} ({:?}) <- 0x{:x}", offset, width, value);
        Ok(())
    }

    async fn blocking<T, F>(&self, what: &str, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Firmware, &str) -> Result<T> + Send + 'static,
    {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| VpcError::unavailable("device handle is not bound"))?;
        let firmware = Arc::clone(&handle.firmware);
        let device = handle.path.clone();
        tokio::task::spawn_blocking(move || call(firmware.as_ref(), &device))
            .await
            .map_err(|e| VpcError::evaluation(what, format!("firmware call aborted: {}", e)))?
    }
}

fn next_offset(offset: u8) -> Result<u8> {
    offset
        .checked_add(1)
        .ok_or_else(|| VpcError::invalid(format!("word access at 0x{:02x} runs past the EC map", offset)))
}

// ============================================================================
// acpi_call backend
// ============================================================================

/// Linux backend over the `acpi_call` module and the `ec_sys` register file
#[derive(Debug, Clone)]
pub struct AcpiCallFirmware {
    call_path: PathBuf,
    ec_io_path: Option<PathBuf>,
}

impl AcpiCallFirmware {
    pub fn new(call_path: impl Into<PathBuf>, ec_io_path: Option<PathBuf>) -> Self {
        Self { call_path: call_path.into(), ec_io_path }
    }

    /// True when the kernel interface is present
    pub fn is_available(&self) -> bool {
        self.call_path.exists()
    }

    fn ec_io(&self) -> Option<&Path> {
        self.ec_io_path.as_deref().filter(|p| p.exists())
    }

    fn call(&self, command: &str) -> Result<String> {
        fs::write(&self.call_path, command).map_err(|e| self.io_error(e))?;
        let raw = fs::read(&self.call_path).map_err(|e| self.io_error(e))?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn io_error(&self, err: io::Error) -> VpcError {
        if err.kind() == io::ErrorKind::NotFound {
            VpcError::unavailable(format!(
                "{} not present (is the acpi_call module loaded?)",
                self.call_path.display()
            ))
        } else {
            VpcError::Io(err)
        }
    }
}

impl Firmware for AcpiCallFirmware {
    fn evaluate(&self, device: &str, method: &str, args: &[u32]) -> Result<u32> {
        let mut command = format!("{}.{}", device, method);
        for arg in args {
            let _ = write!(command, " 0x{:x}", arg);
        }
        trace!("acpi_call <- {}", command);
        let output = self.call(&command)?;
        trace!("acpi_call -> {}", output.trim_end_matches('\0'));
        parse_call_output(method, &output)
    }

    fn read_ec(&self, device: &str, offset: u8) -> Result<u8> {
        let Some(path) = self.ec_io() else {
            return read_ec_by_method(self, device, offset);
        };
        let mut file = fs::File::open(path)?;
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        let mut buf = [0u8; 1];
        file.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn write_ec(&self, device: &str, offset: u8, value: u8) -> Result<()> {
        let Some(path) = self.ec_io() else {
            return write_ec_by_method(self, device, offset, value);
        };
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        file.write_all(&[value])?;
        Ok(())
    }
}

/// Interpret the text acpi_call leaves behind after a call
pub fn parse_call_output(method: &str, raw: &str) -> Result<u32> {
    let out = raw.trim_matches(|c: char| c == '\0' || c.is_whitespace());

    if let Some(err) = out.strip_prefix("Error:") {
        let err = err.trim();
        return if err.contains(AE_NOT_FOUND) {
            Err(VpcError::method_missing(method))
        } else {
            Err(VpcError::evaluation(method, err))
        };
    }

    if out.is_empty() || out == "not called" {
        return Err(VpcError::evaluation(method, "no result"));
    }

    let Some(hex) = out.strip_prefix("0x") else {
        return Err(VpcError::evaluation(method, format!("unexpected result {:?}", out)));
    };

    let value = u64::from_str_radix(hex, 16)
        .map_err(|_| VpcError::evaluation(method, format!("unexpected result {:?}", out)))?;
    u32::try_from(value)
        .map_err(|_| VpcError::evaluation(method, format!("result {} exceeds 32 bits", out)))
}
