//! Breach alerts: message formatting, the persisted rate limit and the
//! dispatcher that ties location, upload and SMS together.

mod dispatcher;
mod limiter;
mod message;

pub use dispatcher::{
    AlertDispatcher, AlertRequest, AlertSink, BackgroundAlertSink, DispatchReport,
    EvidenceUploader, LocationProvider, SmsTransport, UploadReceipt,
};
pub use limiter::RateLimiter;
pub use message::{
    compose_message, normalize_recipient, split_parts, AlertEvent, BreachKind, ALERT_HEADER,
    EVIDENCE_PLACEHOLDER, LOCATION_PLACEHOLDER,
};
