pub mod encoder;
pub mod face;
pub mod frame;
pub mod model;
pub mod video;
pub mod yunet;

// Re-export commonly used types
pub use encoder::{EncodeOutcome, Encoding, EncoderSettings, FaceEncoder, OnnxFaceEncoder, ENCODING_DIM};
pub use face::Detection;
pub use frame::Frame;
pub use video::Camera;
