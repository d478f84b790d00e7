use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use facegate_vision::video::{Camera, VideoError};
use facegate_vision::Frame;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera {device} is unavailable: {reason}")]
    Unavailable { device: String, reason: String },

    #[error("camera {device} is already in use")]
    Busy { device: String },

    #[error("camera {device} failed: {reason}")]
    DeviceFailure { device: String, reason: String },
}

/// An opened hardware stream. Dropping it releases the device.
///
/// `capture` must return within a bounded time even when the device stops
/// delivering frames; the session joins its preview loop on cancel.
pub trait CameraBackend: Send {
    fn capture(&mut self) -> Result<Frame, CameraError>;
}

/// Knows how to open a device path.
pub trait CameraDriver: Send + Sync {
    fn open(&self, device: &str) -> Result<Box<dyn CameraBackend>, CameraError>;
}

/// V4L2 through `facegate_vision::Camera`. Each read gives up after `timeout`.
#[derive(Debug, Clone, Copy)]
pub struct V4lDriver {
    timeout: Duration,
}

impl V4lDriver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

struct V4lBackend {
    device: String,
    camera: Camera,
}

impl CameraDriver for V4lDriver {
    fn open(&self, device: &str) -> Result<Box<dyn CameraBackend>, CameraError> {
        let camera = Camera::open(device, self.timeout).map_err(|e| classify(device, &e))?;
        Ok(Box::new(V4lBackend {
            device: device.to_string(),
            camera,
        }))
    }
}

impl CameraBackend for V4lBackend {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        self.camera
            .frame()
            .map_err(|e| CameraError::DeviceFailure {
                device: self.device.clone(),
                reason: e.to_string(),
            })
    }
}

fn classify(device: &str, err: &VideoError) -> CameraError {
    let device = device.to_string();
    let reason = err.to_string();
    match err.io_error() {
        Some(io) if io.raw_os_error() == Some(libc::EBUSY) => CameraError::Busy { device },
        Some(io)
            if matches!(
                io.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ) =>
        {
            CameraError::Unavailable { device, reason }
        }
        _ if matches!(err, VideoError::Open { .. }) => CameraError::Unavailable { device, reason },
        _ => CameraError::DeviceFailure { device, reason },
    }
}

/// One physical camera. At most one [`CameraSource`] may be open on it.
pub struct CameraDevice {
    path: String,
    driver: Box<dyn CameraDriver>,
    in_use: AtomicBool,
}

impl CameraDevice {
    pub fn new(path: impl Into<String>, driver: impl CameraDriver + 'static) -> Self {
        Self {
            path: path.into(),
            driver: Box::new(driver),
            in_use: AtomicBool::new(false),
        }
    }

    pub fn v4l(path: impl Into<String>, capture_timeout: Duration) -> Self {
        Self::new(path, V4lDriver::new(capture_timeout))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_busy(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Claim the device and start streaming. Fails fast with
    /// [`CameraError::Busy`] while another source is open.
    pub fn open(self: &Arc<Self>) -> Result<CameraSource, CameraError> {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CameraError::Busy {
                device: self.path.clone(),
            });
        }
        match self.driver.open(&self.path) {
            Ok(backend) => {
                log::debug!("camera {} opened", self.path);
                Ok(CameraSource {
                    device: Arc::clone(self),
                    backend: Mutex::new(Some(backend)),
                    last_sequence: AtomicU64::new(0),
                })
            }
            Err(e) => {
                self.in_use.store(false, Ordering::Release);
                Err(e)
            }
        }
    }
}

/// Scoped handle on an open camera. Closed explicitly with [`close`] or on drop.
///
/// [`close`]: CameraSource::close
pub struct CameraSource {
    device: Arc<CameraDevice>,
    backend: Mutex<Option<Box<dyn CameraBackend>>>,
    last_sequence: AtomicU64,
}

impl CameraSource {
    pub fn device(&self) -> &str {
        self.device.path()
    }

    pub fn is_open(&self) -> bool {
        self.backend
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Latest frame, or `None` when closed, when the read failed, or when the
    /// driver handed back a frame already delivered.
    pub fn grab(&self) -> Option<Frame> {
        let mut guard = self.backend.lock().unwrap_or_else(|e| e.into_inner());
        let backend = guard.as_mut()?;
        match backend.capture() {
            Ok(frame) => {
                let prev = self.last_sequence.fetch_max(frame.sequence, Ordering::AcqRel);
                (frame.sequence > prev).then_some(frame)
            }
            Err(e) => {
                log::debug!("{e}");
                None
            }
        }
    }

    /// Release the device. Calling it again is a no-op.
    pub fn close(&self) {
        let backend = self
            .backend
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(backend) = backend {
            drop(backend);
            self.device.in_use.store(false, Ordering::Release);
            log::debug!("camera {} closed", self.device.path);
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        released: AtomicUsize,
    }

    struct FakeDriver(Arc<Counters>);

    struct FakeBackend {
        counters: Arc<Counters>,
        seq: u64,
    }

    impl CameraDriver for FakeDriver {
        fn open(&self, _device: &str) -> Result<Box<dyn CameraBackend>, CameraError> {
            self.0.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeBackend {
                counters: self.0.clone(),
                seq: 0,
            }))
        }
    }

    impl CameraBackend for FakeBackend {
        fn capture(&mut self) -> Result<Frame, CameraError> {
            self.seq += 1;
            Ok(Frame::new(image::RgbImage::new(4, 4), self.seq))
        }
    }

    impl Drop for FakeBackend {
        fn drop(&mut self) {
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct BrokenDriver;

    impl CameraDriver for BrokenDriver {
        fn open(&self, device: &str) -> Result<Box<dyn CameraBackend>, CameraError> {
            Err(CameraError::Unavailable {
                device: device.into(),
                reason: "unplugged".into(),
            })
        }
    }

    fn fake_device() -> (Arc<CameraDevice>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let device = Arc::new(CameraDevice::new("/dev/fake0", FakeDriver(counters.clone())));
        (device, counters)
    }

    #[test]
    fn second_open_is_busy_until_close() {
        let (device, counters) = fake_device();
        let source = device.open().unwrap();
        assert!(matches!(device.open(), Err(CameraError::Busy { .. })));
        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);

        source.close();
        let again = device.open().unwrap();
        assert!(again.is_open());
    }

    #[test]
    fn close_is_idempotent() {
        let (device, counters) = fake_device();
        let source = device.open().unwrap();
        source.close();
        source.close();
        drop(source);
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
        assert!(!device.is_busy());
    }

    #[test]
    fn drop_releases_device() {
        let (device, counters) = fake_device();
        {
            let _source = device.open().unwrap();
            assert!(device.is_busy());
        }
        assert!(!device.is_busy());
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn grab_after_close_is_none() {
        let (device, _) = fake_device();
        let source = device.open().unwrap();
        assert_eq!(source.grab().map(|f| f.sequence), Some(1));
        assert_eq!(source.grab().map(|f| f.sequence), Some(2));
        source.close();
        assert!(source.grab().is_none());
    }

    #[test]
    fn failed_open_leaves_device_free() {
        let device = Arc::new(CameraDevice::new("/dev/fake1", BrokenDriver));
        assert!(matches!(
            device.open(),
            Err(CameraError::Unavailable { .. })
        ));
        assert!(!device.is_busy());
    }

    #[test]
    fn busy_errno_is_classified() {
        let err = VideoError::Stream {
            device: "/dev/video0".into(),
            source: io::Error::from_raw_os_error(libc::EBUSY),
        };
        assert_eq!(
            classify("/dev/video0", &err),
            CameraError::Busy {
                device: "/dev/video0".into()
            }
        );
        let missing = VideoError::Open {
            device: "/dev/video9".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(matches!(
            classify("/dev/video9", &missing),
            CameraError::Unavailable { .. }
        ));
    }
}
