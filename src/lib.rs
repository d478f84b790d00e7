pub mod broadcast;
pub mod camera;
pub mod config;
pub mod consensus;
pub mod identity;
pub mod matcher;
pub mod session;
pub mod storage;

// Re-export the types most callers need
pub use camera::{CameraDevice, CameraError, CameraSource};
pub use consensus::{AuthMode, SessionOutcome};
pub use facegate_vision::{EncodeOutcome, Encoding, FaceEncoder, Frame};
pub use session::{Authenticator, EncoderFactory, SessionError, SessionEvent, SessionHandle};
pub use storage::{FaceTemplate, TemplateStore};
