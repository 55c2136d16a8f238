use bytes::{Buf, BufMut, BytesMut};

use crate::protocol::{decode_header_block, encode_header_block, header_block_len, BoxFrame};
use crate::service::global_config;
use crate::{AppError, AppResult};

use super::{BoltRequest, BoltResponse, PROTOCOL_CODE, REQUEST_HEADER_LEN, RESPONSE_HEADER_LEN};

fn read_u16(buf: &BytesMut, offset: usize) -> u16 {
    u16::from_be_bytes(buf[offset..offset + 2].try_into().unwrap())
}

fn read_u32(buf: &BytesMut, offset: usize) -> u32 {
    u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn check_frame_size(total: usize) -> AppResult<()> {
    let max = global_config().network.max_frame_size;
    if total > max {
        return Err(AppError::MalformedProtocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            total, max
        )));
    }
    Ok(())
}

fn check_request(buf: &BytesMut) -> AppResult<usize> {
    if buf.len() < REQUEST_HEADER_LEN {
        return Err(AppError::Incomplete);
    }
    if buf[0] != PROTOCOL_CODE {
        return Err(AppError::MalformedProtocol(format!(
            "unexpected protocol code: {:#04x}",
            buf[0]
        )));
    }
    let class_len = read_u16(buf, 14) as usize;
    let header_len = read_u16(buf, 16) as usize;
    let content_len = read_u32(buf, 18) as usize;
    let total = REQUEST_HEADER_LEN + class_len + header_len + content_len;
    check_frame_size(total)?;
    if buf.len() < total {
        return Err(AppError::Incomplete);
    }
    Ok(total)
}

/// Decode one request or oneway-request command. No bytes are consumed
/// until the whole frame, body included, has arrived.
pub(crate) fn decode_request(buf: &mut BytesMut) -> AppResult<Option<BoxFrame>> {
    let total = match check_request(buf) {
        Ok(total) => total,
        Err(AppError::Incomplete) => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut data = buf.split_to(total);
    let _proto = data.get_u8();
    let cmd_type = data.get_u8();
    let cmd_code = data.get_u16();
    let version = data.get_u8();
    let request_id = data.get_u32();
    let codec = data.get_u8();
    let timeout_ms = data.get_i32();
    let class_len = data.get_u16() as usize;
    let header_len = data.get_u16() as usize;
    let content_len = data.get_u32() as usize;

    let class = data.split_to(class_len).freeze();
    let header = decode_header_block(data.split_to(header_len).freeze())?;
    let content = data.split_to(content_len).freeze();

    Ok(Some(Box::new(BoltRequest {
        cmd_type,
        cmd_code,
        version,
        request_id,
        codec,
        timeout_ms,
        class,
        header,
        content,
    })))
}

fn check_response(buf: &BytesMut) -> AppResult<usize> {
    if buf.len() < RESPONSE_HEADER_LEN {
        return Err(AppError::Incomplete);
    }
    if buf[0] != PROTOCOL_CODE {
        return Err(AppError::MalformedProtocol(format!(
            "unexpected protocol code: {:#04x}",
            buf[0]
        )));
    }
    let class_len = read_u16(buf, 12) as usize;
    let header_len = read_u16(buf, 14) as usize;
    let content_len = read_u32(buf, 16) as usize;
    let total = RESPONSE_HEADER_LEN + class_len + header_len + content_len;
    check_frame_size(total)?;
    if buf.len() < total {
        return Err(AppError::Incomplete);
    }
    Ok(total)
}

pub(crate) fn decode_response(buf: &mut BytesMut) -> AppResult<Option<BoxFrame>> {
    let total = match check_response(buf) {
        Ok(total) => total,
        Err(AppError::Incomplete) => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut data = buf.split_to(total);
    let _proto = data.get_u8();
    let cmd_type = data.get_u8();
    let cmd_code = data.get_u16();
    let version = data.get_u8();
    let request_id = data.get_u32();
    let codec = data.get_u8();
    let status = data.get_u16();
    let class_len = data.get_u16() as usize;
    let header_len = data.get_u16() as usize;
    let content_len = data.get_u32() as usize;

    let class = data.split_to(class_len).freeze();
    let header = decode_header_block(data.split_to(header_len).freeze())?;
    let content = data.split_to(content_len).freeze();

    Ok(Some(Box::new(BoltResponse {
        cmd_type,
        cmd_code,
        version,
        request_id,
        codec,
        status,
        class,
        header,
        content,
    })))
}

/// Fixed header, class, header block and content written back to back in
/// one contiguous buffer.
pub(crate) fn encode_request(request: &BoltRequest) -> BytesMut {
    let header_len = header_block_len(&request.header);
    let mut buf = BytesMut::with_capacity(
        REQUEST_HEADER_LEN + request.class.len() + header_len + request.content.len(),
    );
    buf.put_u8(PROTOCOL_CODE);
    buf.put_u8(request.cmd_type);
    buf.put_u16(request.cmd_code);
    buf.put_u8(request.version);
    buf.put_u32(request.request_id);
    buf.put_u8(request.codec);
    buf.put_i32(request.timeout_ms);
    buf.put_u16(request.class.len() as u16);
    buf.put_u16(header_len as u16);
    buf.put_u32(request.content.len() as u32);
    buf.put_slice(&request.class);
    encode_header_block(&mut buf, &request.header);
    buf.put_slice(&request.content);
    buf
}

pub(crate) fn encode_response(response: &BoltResponse) -> BytesMut {
    let header_len = header_block_len(&response.header);
    let mut buf = BytesMut::with_capacity(
        RESPONSE_HEADER_LEN + response.class.len() + header_len + response.content.len(),
    );
    buf.put_u8(PROTOCOL_CODE);
    buf.put_u8(response.cmd_type);
    buf.put_u16(response.cmd_code);
    buf.put_u8(response.version);
    buf.put_u32(response.request_id);
    buf.put_u8(response.codec);
    buf.put_u16(response.status);
    buf.put_u16(response.class.len() as u16);
    buf.put_u16(header_len as u16);
    buf.put_u32(response.content.len() as u32);
    buf.put_slice(&response.class);
    encode_header_block(&mut buf, &response.header);
    buf.put_slice(&response.content);
    buf
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;
    use crate::protocol::bolt::*;
    use crate::protocol::{status, Header, Protocol, StreamType};

    fn sample_request() -> BoltRequest {
        let mut header = Header::new();
        header.add(b"k", b"v");
        BoltRequest::new(
            42,
            Bytes::from_static(b"A"),
            1000,
            header,
            Bytes::from_static(b"x"),
        )
    }

    #[test]
    fn test_request_round_trip() {
        let proto = BoltProtocol;
        let request = sample_request();
        let mut encoded = proto.encode(&request).unwrap();
        let wire_len = encoded.len();

        let decoded = proto.decode(&mut encoded).unwrap().unwrap();
        assert!(encoded.is_empty(), "decode must consume the whole frame");
        assert_eq!(wire_len, REQUEST_HEADER_LEN + 1 + (4 + 8 + 2) + 1);

        let decoded = decoded.as_any().downcast_ref::<BoltRequest>().unwrap();
        assert_eq!(decoded, &request);
        assert_eq!(decoded.stream_type(), StreamType::Request);
        assert!(!decoded.is_heartbeat());
    }

    #[test]
    fn test_response_round_trip() {
        let proto = BoltProtocol;
        let mut header = Header::new();
        header.add(b"code", b"0");
        let response = BoltResponse::new(
            7,
            RESPONSE_STATUS_SUCCESS,
            Bytes::from_static(b"B"),
            header,
            Bytes::from_static(b"payload"),
        );
        let mut encoded = proto.encode(&response).unwrap();
        let decoded = proto.decode(&mut encoded).unwrap().unwrap();
        assert!(encoded.is_empty());
        let decoded = decoded.as_any().downcast_ref::<BoltResponse>().unwrap();
        assert_eq!(decoded, &response);
        assert_eq!(decoded.status(), RESPONSE_STATUS_SUCCESS as u32);
    }

    #[test]
    fn test_every_prefix_needs_more_without_consuming() {
        let proto = BoltProtocol;
        let request = sample_request();
        let full = proto.encode(&request).unwrap();
        let n = full.len();

        for k in 0..n {
            let mut partial = BytesMut::from(&full[..k]);
            let result = proto.decode(&mut partial).unwrap();
            assert!(result.is_none(), "prefix of {} bytes must need more", k);
            assert_eq!(partial.len(), k, "prefix decode must not consume bytes");
        }

        // the exact frame decodes and consumes exactly n bytes
        let mut exact = BytesMut::from(&full[..]);
        assert!(proto.decode(&mut exact).unwrap().is_some());
        assert!(exact.is_empty());
    }

    #[test]
    fn test_two_pipelined_frames_decode_in_order() {
        let proto = BoltProtocol;
        let mut first = sample_request();
        first.request_id = 1;
        let mut second = sample_request();
        second.request_id = 2;

        let mut buf = proto.encode(&first).unwrap();
        buf.extend_from_slice(&proto.encode(&second).unwrap());

        let one = proto.decode(&mut buf).unwrap().unwrap();
        let two = proto.decode(&mut buf).unwrap().unwrap();
        assert_eq!(one.request_id(), 1);
        assert_eq!(two.request_id(), 2);
        assert!(buf.is_empty());
        assert!(proto.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_heartbeat_frames_are_empty_bodied() {
        let proto = BoltProtocol;
        let trigger = proto.heartbeat_trigger(9);
        assert!(trigger.is_heartbeat());
        assert_eq!(trigger.request_id(), 9);

        let mut encoded = proto.encode(trigger.as_ref()).unwrap();
        assert_eq!(encoded.len(), REQUEST_HEADER_LEN);

        let decoded = proto.decode(&mut encoded).unwrap().unwrap();
        let request = decoded.as_any().downcast_ref::<BoltRequest>().unwrap();
        assert_eq!(request.cmd_code, CMD_CODE_HEARTBEAT);
        assert_eq!(request.timeout_ms, -1);
        assert!(request.class.is_empty() && request.content.is_empty());
        assert!(request.header.is_empty());

        let reply = proto.heartbeat_reply(9);
        let reply = reply.as_any().downcast_ref::<BoltResponse>().unwrap();
        assert_eq!(reply.request_id, 9);
        assert_eq!(reply.status, RESPONSE_STATUS_SUCCESS);
        assert!(reply.is_heartbeat());
    }

    #[test]
    fn test_unknown_cmd_type_is_a_decode_error() {
        let proto = BoltProtocol;
        let mut buf = BytesMut::from(&encode_request(&sample_request())[..]);
        buf[1] = 9;
        assert!(proto.decode(&mut buf).is_err());
    }

    #[test]
    fn test_unknown_protocol_code_is_a_decode_error() {
        let proto = BoltProtocol;
        let mut buf = BytesMut::from(&encode_request(&sample_request())[..]);
        buf[0] = 0x7f;
        assert!(proto.decode(&mut buf).is_err());
    }

    #[test]
    fn test_encode_rejects_foreign_frames() {
        #[derive(Debug)]
        struct ForeignFrame(Header);
        impl crate::protocol::Frame for ForeignFrame {
            fn request_id(&self) -> u64 {
                0
            }
            fn set_request_id(&mut self, _id: u64) {}
            fn stream_type(&self) -> StreamType {
                StreamType::Request
            }
            fn is_heartbeat(&self) -> bool {
                false
            }
            fn header(&self) -> &Header {
                &self.0
            }
            fn header_mut(&mut self) -> &mut Header {
                &mut self.0
            }
            fn payload(&self) -> &[u8] {
                &[]
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }

        let proto = BoltProtocol;
        let frame = ForeignFrame(Header::new());
        assert!(matches!(
            proto.encode(&frame),
            Err(AppError::UnknownFrameType(_))
        ));
    }

    #[test]
    fn test_status_mapping() {
        let proto = BoltProtocol;
        assert_eq!(proto.map_status(status::SUCCESS), RESPONSE_STATUS_SUCCESS as u32);
        assert_eq!(
            proto.map_status(status::ROUTER_UNAVAILABLE),
            RESPONSE_STATUS_NO_PROCESSOR as u32
        );
        assert_eq!(proto.map_status(status::TIMEOUT), RESPONSE_STATUS_TIMEOUT as u32);
        assert_eq!(
            proto.map_status(status::NO_HEALTH_UPSTREAM),
            RESPONSE_STATUS_CONNECTION_CLOSED as u32
        );
        assert_eq!(
            proto.map_status(status::UPSTREAM_OVERFLOW),
            RESPONSE_STATUS_SERVER_THREADPOOL_BUSY as u32
        );
        assert_eq!(
            proto.map_status(status::CODEC_EXCEPTION),
            RESPONSE_STATUS_CODEC_EXCEPTION as u32
        );
        assert_eq!(
            proto.map_status(status::DESERIAL_EXCEPTION),
            RESPONSE_STATUS_SERVER_DESERIAL_EXCEPTION as u32
        );
        // everything else collapses to unknown
        assert_eq!(proto.map_status(599), RESPONSE_STATUS_UNKNOWN as u32);
    }
}
