pub mod acks;
pub mod control;
pub mod errors;
pub mod frame;
pub mod headers;
pub mod ids;
pub mod selector;
pub mod status;
pub mod topic;

pub use acks::{AckLabel, Acknowledgement};
pub use control::{ControlFrame, StreamKind};
pub use errors::{AcknowledgementError, ConfigError, ConnectionError, FrameError, RequestError};
pub use frame::{Envelope, Frame};
pub use headers::Headers;
pub use ids::{CorrelationId, RegistrationId, ThingId};
pub use selector::{Address, Selector};
pub use topic::{Channel, CommandAction, Criterion, Group, TopicPath};
