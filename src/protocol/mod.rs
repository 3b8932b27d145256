//! The engine's text protocol: command templates, framing and replies.

pub mod decode;
pub mod frame;
pub mod interpolate;

pub use decode::{decode, strip_engine_text, DecodedValue, Scalar, RESULT_TAG};
pub use frame::{encode_request, parse_length_header, ReplyHeader};
pub use interpolate::{interpolate, Namespace, TemplateValue};
