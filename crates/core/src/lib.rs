pub mod dispatch;
pub mod error;
pub mod media;
pub mod protocol;
pub mod retriever;
pub mod session;
pub mod transport;
pub mod url;

pub use dispatch::{Callbacks, ErrorEvent, SessionStart};
pub use error::{ErrorCode, Result, RetrieverError};
pub use media::{
    AssembledUnit, DiagnosticsSnapshot, ExtensionLayout, ExtensionRecord, FrameGeometry, MediaKind,
    RtpInfo, StreamDescriptor,
};
pub use retriever::{MediaSelection, Retriever, RetrieverConfig, RetrieverGuard, TransportMode};
pub use session::SessionState;
pub use url::{AxisUrlParams, RtspUrl, build_axis_rtsp_url};
