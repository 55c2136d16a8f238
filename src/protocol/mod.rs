// Copyright 2025 The meshgate Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod bolt;
mod header;
mod registry;

pub use header::{decode_header_block, encode_header_block, header_block_len, BytesKv, Header};
pub use registry::{protocol, register_protocol};

use std::any::Any;
use std::fmt::Debug;

use bytes::BytesMut;

use crate::AppResult;

/// Registry key of a wire codec.
pub type ProtocolName = &'static str;

/// Proxy-originated status space. Hijacked responses are minted with one
/// of these codes and projected into the active protocol's own status
/// space through `Protocol::map_status`.
pub mod status {
    pub const CODEC_EXCEPTION: u32 = 0;
    pub const UNKNOWN: u32 = 2;
    pub const DESERIAL_EXCEPTION: u32 = 3;
    pub const SUCCESS: u32 = 200;
    pub const PERMISSION_DENIED: u32 = 403;
    pub const ROUTER_UNAVAILABLE: u32 = 404;
    pub const NO_HEALTH_UPSTREAM: u32 = 502;
    pub const UPSTREAM_OVERFLOW: u32 = 503;
    pub const TIMEOUT: u32 = 504;
    pub const LIMIT_EXCEEDED: u32 = 509;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Request,
    OnewayRequest,
    Response,
}

/// One decoded protocol message. Every codec exposes its request and
/// response commands through this trait so the stream layer and the
/// proxy driver can rewrite ids and read metadata without knowing the
/// concrete wire format.
pub trait Frame: Debug + Send {
    fn request_id(&self) -> u64;

    /// Stream ids are rewritten independently on ingress and egress of
    /// each connection.
    fn set_request_id(&mut self, id: u64);

    fn stream_type(&self) -> StreamType;

    fn is_heartbeat(&self) -> bool;

    fn header(&self) -> &Header;

    fn header_mut(&mut self) -> &mut Header;

    fn payload(&self) -> &[u8];

    /// Protocol status carried by responses; requests report success.
    fn status(&self) -> u32 {
        status::SUCCESS
    }

    fn as_any(&self) -> &dyn Any;
}

pub type BoxFrame = Box<dyn Frame>;

/// A wire codec. Implementations are registered process-wide by name and
/// shared behind `Arc`; all methods take `&self`.
pub trait Protocol: Send + Sync {
    fn name(&self) -> ProtocolName;

    /// Decode at most one frame from the front of `buf`. Bytes are only
    /// consumed when a complete frame is returned; `Ok(None)` asks the
    /// caller to read more input first.
    fn decode(&self, buf: &mut BytesMut) -> AppResult<Option<BoxFrame>>;

    /// Encode one of this codec's own frames. Frames of any other codec
    /// are rejected with an unknown-type error.
    fn encode(&self, frame: &dyn Frame) -> AppResult<BytesMut>;

    /// Synthesise a keep-alive request carrying the given id.
    fn heartbeat_trigger(&self, request_id: u64) -> BoxFrame;

    /// Synthesise the success reply to a keep-alive with a matching id.
    fn heartbeat_reply(&self, request_id: u64) -> BoxFrame;

    /// Synthesise a proxy-originated response. The request id is filled
    /// in by the stream layer when the response is written out.
    fn hijack_reply(&self, status: u32) -> BoxFrame;

    /// Project a proxy status code into this protocol's status space.
    fn map_status(&self, proxy_status: u32) -> u32;

    /// Extra routing metadata carried by a request, merged into the
    /// routing headers before route matching.
    fn request_metas(&self, _frame: &dyn Frame) -> Vec<(String, String)> {
        Vec::new()
    }

    fn service_name(&self, _frame: &dyn Frame) -> Option<String> {
        None
    }

    fn method_name(&self, _frame: &dyn Frame) -> Option<String> {
        None
    }
}
