use std::io;
use std::time::Duration;

use image::RgbImage;
use thiserror::Error;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use crate::frame::Frame;

#[derive(Debug, Error)]
pub enum VideoError {
    #[error("failed to open video device {device}: {source}")]
    Open {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to start streaming on {device}: {source}")]
    Stream {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("no frame from the device within {0:?}")]
    Timeout(Duration),

    #[error("failed to capture frame: {0}")]
    Capture(#[source] io::Error),

    #[error("unusable frame: {0}")]
    Frame(String),
}

impl VideoError {
    /// The OS error behind an open or stream failure, if there is one.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            VideoError::Open { source, .. }
            | VideoError::Stream { source, .. }
            | VideoError::Capture(source) => Some(source),
            VideoError::Timeout(_) | VideoError::Frame(_) => None,
        }
    }
}

/// Memory-mapped V4L2 capture stream producing RGB frames.
pub struct Camera {
    stream: Stream<'static>,
    width: u32,
    height: u32,
    fourcc: FourCC,
    sequence: u64,
    timeout: Duration,
}

impl Camera {
    /// Open `device` for streaming. A [`frame`](Camera::frame) call blocks
    /// for at most `timeout`.
    pub fn open(device: &str, timeout: Duration) -> Result<Self, VideoError> {
        let open_err = |source| VideoError::Open {
            device: device.to_string(),
            source,
        };
        let dev = Device::with_path(device).map_err(open_err)?;
        let mut fmt = dev.format().map_err(open_err)?;
        // Prefer RGB, then YUYV, then MJPG, else keep whatever the driver picked
        for code in [b"RGB3", b"YUYV", b"MJPG"] {
            let desired = Format::new(fmt.width, fmt.height, FourCC::new(code));
            fmt = dev.set_format(&desired).unwrap_or(fmt);
            if fmt.fourcc == FourCC::new(code) {
                break;
            }
        }
        let mut stream =
            Stream::with_buffers(&dev, Type::VideoCapture, 4).map_err(|source| {
                VideoError::Stream {
                    device: device.to_string(),
                    source,
                }
            })?;
        stream.set_timeout(timeout);
        log::debug!(
            "opened {} at {}x{} ({:?})",
            device,
            fmt.width,
            fmt.height,
            fmt.fourcc
        );
        Ok(Self {
            stream,
            width: fmt.width,
            height: fmt.height,
            fourcc: fmt.fourcc,
            sequence: 0,
            timeout,
        })
    }

    /// Dequeue the next buffer from the driver and convert it to RGB.
    pub fn frame(&mut self) -> Result<Frame, VideoError> {
        let timeout = self.timeout;
        let (data, meta) = self
            .stream
            .next()
            .map_err(|e| capture_error(e, timeout))?;
        log::trace!(
            "captured frame: {}x{} fourcc={:?} seq={} len={}",
            self.width,
            self.height,
            self.fourcc,
            meta.sequence,
            data.len()
        );
        let image = match self.fourcc {
            f if f == FourCC::new(b"MJPG") => image::load_from_memory(data)
                .map_err(|e| VideoError::Frame(format!("mjpeg decode: {e}")))?
                .to_rgb8(),
            f => {
                let buf = if f == FourCC::new(b"RGB3") {
                    data.to_vec()
                } else if f == FourCC::new(b"YUYV") {
                    yuyv_to_rgb(self.width, self.height, data)?
                } else if f == FourCC::new(b"GREY") {
                    grey_to_rgb(self.width, self.height, data)?
                } else {
                    return Err(VideoError::Frame(format!("unsupported pixel format {f:?}")));
                };
                let expected = (self.width * self.height * 3) as usize;
                if buf.len() < expected {
                    return Err(VideoError::Frame(format!(
                        "buffer too small: got {}, expected {expected}",
                        buf.len()
                    )));
                }
                RgbImage::from_raw(self.width, self.height, buf)
                    .ok_or_else(|| VideoError::Frame("failed to build image buffer".into()))?
            }
        };
        self.sequence += 1;
        Ok(Frame::new(image, self.sequence))
    }
}

fn capture_error(err: io::Error, timeout: Duration) -> VideoError {
    match err.kind() {
        io::ErrorKind::TimedOut => VideoError::Timeout(timeout),
        _ => VideoError::Capture(err),
    }
}

pub fn yuyv_to_rgb(width: u32, height: u32, data: &[u8]) -> Result<Vec<u8>, VideoError> {
    let expected = (width * height * 2) as usize;
    if data.len() < expected {
        return Err(VideoError::Frame("short YUYV buffer".into()));
    }
    let mut out = Vec::with_capacity((width * height * 3) as usize);
    for chunk in data[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0] as f32, chunk[2] as f32] {
            out.push(clamp(y + 1.402 * v));
            out.push(clamp(y - 0.344136 * u - 0.714136 * v));
            out.push(clamp(y + 1.772 * u));
        }
    }
    Ok(out)
}

pub fn grey_to_rgb(width: u32, height: u32, data: &[u8]) -> Result<Vec<u8>, VideoError> {
    let expected = (width * height) as usize;
    if data.len() < expected {
        return Err(VideoError::Frame("short GREY buffer".into()));
    }
    Ok(data[..expected].iter().flat_map(|&y| [y, y, y]).collect())
}

fn clamp(v: f32) -> u8 {
    v.clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_neutral_chroma_is_grey() {
        // Two pixels sharing U=V=128 must come out with equal channels
        let data = [100u8, 128, 200, 128];
        let rgb = yuyv_to_rgb(2, 1, &data).unwrap();
        assert_eq!(rgb, vec![100, 100, 100, 200, 200, 200]);
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(yuyv_to_rgb(4, 4, &[0u8; 8]).is_err());
        assert!(grey_to_rgb(4, 4, &[0u8; 8]).is_err());
    }

    #[test]
    fn dequeue_timeout_is_its_own_error() {
        let timeout = Duration::from_millis(120);
        let err = capture_error(io::Error::from(io::ErrorKind::TimedOut), timeout);
        assert!(matches!(err, VideoError::Timeout(t) if t == timeout));
        assert!(err.io_error().is_none());

        let err = capture_error(io::Error::other("EIO"), timeout);
        assert!(matches!(err, VideoError::Capture(_)));
    }

    #[test]
    fn grey_expands_to_three_channels() {
        let rgb = grey_to_rgb(2, 1, &[7, 9]).unwrap();
        assert_eq!(rgb, vec![7, 7, 7, 9, 9, 9]);
    }
}
