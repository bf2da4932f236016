//! Worker wire protocol: message types and length-delimited framing.
//!
//! ## Contents
//! - [`Envelope`], [`Payload`], [`AnalysisRequest`], [`AnalysisResponse`] message model
//! - [`FrameReader`], [`FrameWriter`] framed transport over any `AsyncRead`/`AsyncWrite`

mod codec;
mod message;

pub use codec::{
    FrameReader, FrameWriter, MAX_FRAME_BYTES, decode_envelope, encode_envelope, frame_codec,
};
pub use message::{
    AnalysisId, AnalysisKey, AnalysisRequest, AnalysisResponse, ElementContent, Envelope,
    InstanceId, MessageStatus, Payload, Perform, ResultElement, ResultStatus, ResultTree,
};
