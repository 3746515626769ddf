//! Virtual input devices.
//!
//! Every mandelbox gets three kernel uinput devices: an absolute pointer, a
//! relative pointer and a keyboard. The `/dev/input/eventN` nodes are mapped
//! into the container, and the uinput file descriptors themselves are handed
//! to the in-container protocol over a Unix socket so it can inject events.
//!
//! The host keeps its own descriptors open until teardown, at which point the
//! devices are destroyed.

use crate::error::{CoreError, Result};
use mandel_runtime::DeviceMapping;
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use std::fs::{File, OpenOptions};
use std::io::{IoSlice, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

/// Which virtual device to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDeviceKind {
    /// Pointer reporting absolute coordinates.
    AbsoluteMouse,
    /// Pointer reporting relative motion and wheels.
    RelativeMouse,
    /// Full keyboard.
    Keyboard,
}

impl InputDeviceKind {
    /// The devices every mandelbox gets, in the order they are sent.
    pub const ALL: [InputDeviceKind; 3] = [
        InputDeviceKind::AbsoluteMouse,
        InputDeviceKind::RelativeMouse,
        InputDeviceKind::Keyboard,
    ];

    fn device_name(&self) -> &'static str {
        match self {
            Self::AbsoluteMouse => "Whist Virtual Absolute Input",
            Self::RelativeMouse => "Whist Virtual Relative Input",
            Self::Keyboard => "Whist Virtual Keyboard",
        }
    }
}

/// One created virtual device.
#[derive(Debug)]
pub struct InputDevice {
    /// Device kind.
    pub kind: InputDeviceKind,
    /// Host-side handle used to inject events.
    pub file: File,
    /// Event node the kernel created for the device.
    pub event_path: PathBuf,
}

/// Creates and destroys virtual input devices.
pub trait InputDeviceFactory: Send + Sync {
    /// Create a device of the given kind. Blocking.
    fn create(&self, kind: InputDeviceKind) -> Result<InputDevice>;

    /// Destroy a device created by this factory. Blocking, best effort.
    fn destroy(&self, device: &InputDevice);
}

/// The set of devices owned by one mandelbox. Destroyed on drop.
pub struct UinputDevices {
    devices: Vec<InputDevice>,
    factory: Arc<dyn InputDeviceFactory>,
}

impl UinputDevices {
    /// Raw descriptors in send order.
    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.devices.iter().map(|d| d.file.as_raw_fd()).collect()
    }

    /// Device mappings for the container runtime.
    pub fn mappings(&self) -> Vec<DeviceMapping> {
        self.devices
            .iter()
            .map(|d| DeviceMapping::same_path(d.event_path.to_string_lossy(), "rwm"))
            .collect()
    }

    /// Devices in send order.
    pub fn devices(&self) -> &[InputDevice] {
        &self.devices
    }
}

impl std::fmt::Debug for UinputDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UinputDevices")
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl Drop for UinputDevices {
    fn drop(&mut self) {
        for device in &self.devices {
            self.factory.destroy(device);
        }
    }
}

/// Hands out device sets per mandelbox.
#[derive(Clone)]
pub struct UinputPool {
    factory: Arc<dyn InputDeviceFactory>,
}

impl std::fmt::Debug for UinputPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UinputPool").finish_non_exhaustive()
    }
}

impl UinputPool {
    /// Create a pool backed by `factory`.
    pub fn new(factory: Arc<dyn InputDeviceFactory>) -> Self {
        Self { factory }
    }

    /// Create the full device set. Devices created before a failure are
    /// destroyed again.
    pub async fn allocate(&self) -> Result<(Arc<UinputDevices>, Vec<DeviceMapping>)> {
        let factory = Arc::clone(&self.factory);
        let devices = tokio::task::spawn_blocking(move || {
            let mut set = UinputDevices {
                devices: Vec::with_capacity(InputDeviceKind::ALL.len()),
                factory: Arc::clone(&factory),
            };
            for kind in InputDeviceKind::ALL {
                set.devices.push(factory.create(kind)?);
            }
            Ok::<_, CoreError>(set)
        })
        .await
        .map_err(|e| CoreError::Io(std::io::Error::other(e)))??;

        let mappings = devices.mappings();
        tracing::debug!(count = mappings.len(), "Created uinput devices");
        Ok((Arc::new(devices), mappings))
    }
}

/// Serve the device descriptors to the first client of `socket_path`.
///
/// Returns once the descriptors were sent, or when `cancel` fires first.
/// A peer that hangs up during teardown is not an error.
pub async fn send_device_fds(
    devices: Arc<UinputDevices>,
    socket_path: &Path,
    cancel: CancellationToken,
) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::remove_file(socket_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(socket_path)?;
    tracing::debug!(path = %socket_path.display(), "Waiting for uinput socket client");

    let stream = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!(path = %socket_path.display(), "Uinput socket closed before a client connected");
            return Ok(());
        }
        accepted = listener.accept() => accepted?.0,
    };

    let fds = devices.raw_fds();
    let payload = [0u8];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            ready = stream.writable() => ready?,
        }

        let sent = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(&payload)];
            let cmsg = [ControlMessage::ScmRights(&fds)];
            sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
                .map_err(std::io::Error::from)
        });

        match sent {
            Ok(_) => break,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::NotConnected
                ) =>
            {
                tracing::warn!(error = %e, "Uinput socket client went away before receiving devices");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }

    tracing::info!(count = fds.len(), "Sent uinput device descriptors");
    Ok(())
}

// ============================================================================
// Kernel uinput
// ============================================================================

const EV_KEY: u64 = 0x01;
const EV_REL: u64 = 0x02;
const EV_ABS: u64 = 0x03;

const BTN_LEFT: u64 = 0x110;
const BTN_RIGHT: u64 = 0x111;
const BTN_MIDDLE: u64 = 0x112;
const BTN_SIDE: u64 = 0x113;
const BTN_EXTRA: u64 = 0x114;
const BTN_TOUCH: u64 = 0x14a;

const REL_X: u64 = 0x00;
const REL_Y: u64 = 0x01;
const REL_HWHEEL: u64 = 0x06;
const REL_WHEEL: u64 = 0x08;
const REL_WHEEL_HI_RES: u64 = 0x0b;
const REL_HWHEEL_HI_RES: u64 = 0x0c;

const ABS_X: usize = 0x00;
const ABS_Y: usize = 0x01;
const ABS_CNT: usize = 0x40;
const ABS_RANGE_MAX: i32 = 0xFFF;

const KEY_MAX_USED: u64 = 248;
const UINPUT_MAX_NAME_SIZE: usize = 80;
const BUS_USB: u16 = 0x03;

nix::ioctl_none!(ui_dev_create, b'U', 1);
nix::ioctl_none!(ui_dev_destroy, b'U', 2);
nix::ioctl_write_int!(ui_set_evbit, b'U', 100);
nix::ioctl_write_int!(ui_set_keybit, b'U', 101);
nix::ioctl_write_int!(ui_set_relbit, b'U', 102);
nix::ioctl_write_int!(ui_set_absbit, b'U', 103);
nix::ioctl_read_buf!(ui_get_sysname, b'U', 44, u8);

/// Creates devices through `/dev/uinput`.
#[derive(Debug, Clone)]
pub struct UinputFactory {
    uinput_path: PathBuf,
    sysfs_root: PathBuf,
}

impl Default for UinputFactory {
    fn default() -> Self {
        Self {
            uinput_path: PathBuf::from("/dev/uinput"),
            sysfs_root: PathBuf::from("/sys/devices/virtual/input"),
        }
    }
}

impl UinputFactory {
    /// Factory over the standard device paths.
    pub fn new() -> Self {
        Self::default()
    }

    fn configure(fd: RawFd, kind: InputDeviceKind) -> nix::Result<()> {
        // SAFETY: `fd` is an open uinput descriptor and every request below
        // takes an integer argument.
        unsafe {
            match kind {
                InputDeviceKind::AbsoluteMouse => {
                    ui_set_evbit(fd, EV_KEY as _)?;
                    for btn in [BTN_LEFT, BTN_RIGHT, BTN_MIDDLE, BTN_SIDE, BTN_EXTRA, BTN_TOUCH] {
                        ui_set_keybit(fd, btn as _)?;
                    }
                    ui_set_evbit(fd, EV_ABS as _)?;
                    ui_set_absbit(fd, ABS_X as _)?;
                    ui_set_absbit(fd, ABS_Y as _)?;
                }
                InputDeviceKind::RelativeMouse => {
                    ui_set_evbit(fd, EV_KEY as _)?;
                    for btn in [BTN_LEFT, BTN_RIGHT, BTN_MIDDLE, BTN_SIDE, BTN_EXTRA] {
                        ui_set_keybit(fd, btn as _)?;
                    }
                    ui_set_evbit(fd, EV_REL as _)?;
                    for rel in [
                        REL_X,
                        REL_Y,
                        REL_WHEEL,
                        REL_HWHEEL,
                        REL_WHEEL_HI_RES,
                        REL_HWHEEL_HI_RES,
                    ] {
                        ui_set_relbit(fd, rel as _)?;
                    }
                }
                InputDeviceKind::Keyboard => {
                    ui_set_evbit(fd, EV_KEY as _)?;
                    for key in 1..=KEY_MAX_USED {
                        ui_set_keybit(fd, key as _)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Legacy `struct uinput_user_dev` in native byte order.
    fn user_dev_bytes(kind: InputDeviceKind) -> Vec<u8> {
        let mut name = [0u8; UINPUT_MAX_NAME_SIZE];
        let raw = kind.device_name().as_bytes();
        name[..raw.len()].copy_from_slice(raw);

        let mut absmax = [0i32; ABS_CNT];
        if kind == InputDeviceKind::AbsoluteMouse {
            absmax[ABS_X] = ABS_RANGE_MAX;
            absmax[ABS_Y] = ABS_RANGE_MAX;
        }

        let mut out = Vec::with_capacity(UINPUT_MAX_NAME_SIZE + 12 + 4 * 4 * ABS_CNT);
        out.extend_from_slice(&name);
        for id_field in [BUS_USB, 0x1, 0x1, 0x1] {
            out.extend_from_slice(&id_field.to_ne_bytes());
        }
        out.extend_from_slice(&0u32.to_ne_bytes());
        for v in absmax {
            out.extend_from_slice(&v.to_ne_bytes());
        }
        // absmin, absfuzz, absflat
        out.extend(std::iter::repeat(0u8).take(3 * 4 * ABS_CNT));
        out
    }

    fn event_path(&self, fd: RawFd) -> Result<PathBuf> {
        let mut buf = [0u8; 64];
        // SAFETY: the buffer outlives the call and its length is encoded in
        // the request.
        unsafe { ui_get_sysname(fd, &mut buf) }
            .map_err(|e| CoreError::Io(std::io::Error::from(e)))?;
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        let sysname = String::from_utf8_lossy(&buf[..end]).into_owned();

        let dir = self.sysfs_root.join(&sysname);
        for entry in std::fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("event") {
                return Ok(PathBuf::from("/dev/input").join(name.as_ref()));
            }
        }
        Err(CoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no event node under {}", dir.display()),
        )))
    }
}

impl InputDeviceFactory for UinputFactory {
    fn create(&self, kind: InputDeviceKind) -> Result<InputDevice> {
        let mut file = OpenOptions::new()
            .write(true)
            .custom_flags(nix::fcntl::OFlag::O_NONBLOCK.bits())
            .open(&self.uinput_path)?;
        let fd = file.as_raw_fd();

        Self::configure(fd, kind).map_err(|e| CoreError::Io(std::io::Error::from(e)))?;
        file.write_all(&Self::user_dev_bytes(kind))?;
        // SAFETY: `fd` is an open, configured uinput descriptor.
        unsafe { ui_dev_create(fd) }.map_err(|e| CoreError::Io(std::io::Error::from(e)))?;

        let event_path = match self.event_path(fd) {
            Ok(path) => path,
            Err(e) => {
                // SAFETY: the device was created on this descriptor above.
                let _ = unsafe { ui_dev_destroy(fd) };
                return Err(e);
            }
        };

        tracing::trace!(?kind, path = %event_path.display(), "Created uinput device");
        Ok(InputDevice {
            kind,
            file,
            event_path,
        })
    }

    fn destroy(&self, device: &InputDevice) {
        // SAFETY: the descriptor is owned by `device` and still open.
        if let Err(e) = unsafe { ui_dev_destroy(device.file.as_raw_fd()) } {
            tracing::warn!(kind = ?device.kind, error = %e, "Failed to destroy uinput device");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::os::unix::net::UnixStream as StdUnixStream;

    /// Factory handing out temp files instead of kernel devices.
    #[derive(Default)]
    struct FileFactory {
        destroyed: Mutex<Vec<InputDeviceKind>>,
    }

    impl InputDeviceFactory for FileFactory {
        fn create(&self, kind: InputDeviceKind) -> Result<InputDevice> {
            Ok(InputDevice {
                kind,
                file: tempfile::tempfile()?,
                event_path: PathBuf::from(format!("/dev/input/event-{kind:?}")),
            })
        }

        fn destroy(&self, device: &InputDevice) {
            self.destroyed.lock().push(device.kind);
        }
    }

    #[test]
    fn test_user_dev_layout() {
        let bytes = UinputFactory::user_dev_bytes(InputDeviceKind::AbsoluteMouse);
        assert_eq!(bytes.len(), 80 + 8 + 4 + 4 * 4 * 64);
        assert!(bytes.starts_with(b"Whist Virtual Absolute Input"));
        let absmax_x = i32::from_ne_bytes(bytes[92..96].try_into().unwrap());
        assert_eq!(absmax_x, 0xFFF);
    }

    #[tokio::test]
    async fn test_allocate_and_destroy_on_drop() {
        let factory = Arc::new(FileFactory::default());
        let pool = UinputPool::new(factory.clone());

        let (devices, mappings) = pool.allocate().await.unwrap();
        assert_eq!(mappings.len(), 3);
        assert!(mappings.iter().all(|m| m.cgroup_permissions == "rwm"));
        assert_eq!(devices.raw_fds().len(), 3);

        drop(devices);
        assert_eq!(factory.destroyed.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_send_fds_to_client() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("sockets").join("uinput.sock");
        let pool = UinputPool::new(Arc::new(FileFactory::default()));
        let (devices, _) = pool.allocate().await.unwrap();

        let cancel = CancellationToken::new();
        let server = tokio::spawn({
            let socket = socket.clone();
            let cancel = cancel.clone();
            async move { send_device_fds(devices, &socket, cancel).await }
        });

        let mut client = None;
        for _ in 0..100 {
            if let Ok(stream) = StdUnixStream::connect(&socket) {
                client = Some(stream);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let _client = client.expect("socket never came up");

        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_fds_cancelled_without_client() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("uinput.sock");
        let pool = UinputPool::new(Arc::new(FileFactory::default()));
        let (devices, _) = pool.allocate().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        send_device_fds(devices, &socket, cancel).await.unwrap();
    }
}
