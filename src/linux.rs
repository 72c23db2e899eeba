use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd};
use std::path::Path;
use std::time::Duration;

use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::Serial;

/// Line rate of the gateway's USB CDC port
pub const GATEWAY_BAUD: usize = 115_200;

/// Bounds each receive so the reader notices when flashing is finished
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("serial port error: {0}")]
    Serial(#[from] SerialError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Open the gateway device, returning a reader (with [`READ_TIMEOUT`]) and a
/// writer sharing the same port
pub fn open_gateway<P: AsRef<Path>>(
    path: P,
) -> Result<(impl io::Read + Send + 'static, File), LinkError> {
    // Open port
    let mut port = Serial::open(path.as_ref())?;

    // Apply settings
    let mut settings = port.0.read_settings()?;

    settings.set_char_size(CharSize::Bits8);
    settings.set_stop_bits(StopBits::Stop1);
    settings.set_baud_rate(BaudRate::from_speed(GATEWAY_BAUD))?;
    settings.set_flow_control(FlowControl::FlowNone);
    settings.set_parity(Parity::ParityNone);

    port.0.write_settings(&settings)?;
    port.0.set_timeout(READ_TIMEOUT)?;

    // The port holds exclusive access to the device, so the writer is a
    // duplicate of its descriptor rather than a second open
    let writer = duplicate(&port.0)?;

    debug!("Opened {} at {} baud", path.as_ref().display(), GATEWAY_BAUD);

    Ok((port.0, writer))
}

/// Independent handle on the descriptor behind `owner`
fn duplicate<T: AsRawFd>(owner: &T) -> io::Result<File> {
    // SAFETY: `owner` keeps the descriptor open for the whole borrow, which
    // ends once the duplicate exists.
    let fd = unsafe { BorrowedFd::borrow_raw(owner.as_raw_fd()) };
    Ok(File::from(fd.try_clone_to_owned()?))
}
