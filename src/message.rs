use crate::{
    error::TransferError,
    storage::{WorkerOp, WorkerReply},
};

/// The size of the request header.
pub const REQ_HEADER_SIZE: usize = 17;
/// The size of the response header.
pub const RESP_HEADER_SIZE: usize = 17;

/// The Encode trait is used to encode a data structure into a byte buffer.
pub trait Encode {
    fn encode(&self) -> Vec<u8>;
}

/// The Decode trait is used to decode a byte buffer into a data structure.
pub trait Decode {
    fn decode(buf: &[u8]) -> Result<Self, TransferError>
    where
        Self: Sized;
}

/// Read a big-endian u64 at `offset`.
pub fn read_u64(buf: &[u8], offset: usize) -> Result<u64, TransferError> {
    let bytes = buf
        .get(offset..offset + 8)
        .ok_or_else(|| TransferError::Protocol("Insufficient bytes".to_string()))?;
    Ok(u64::from_be_bytes(bytes.try_into().map_err(|_| {
        TransferError::Protocol("Failed to convert bytes".to_string())
    })?))
}

/// Read a big-endian u32 at `offset`.
pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32, TransferError> {
    let bytes = buf
        .get(offset..offset + 4)
        .ok_or_else(|| TransferError::Protocol("Insufficient bytes".to_string()))?;
    Ok(u32::from_be_bytes(bytes.try_into().map_err(|_| {
        TransferError::Protocol("Failed to convert bytes".to_string())
    })?))
}

fn utf8(bytes: Vec<u8>) -> Result<String, TransferError> {
    String::from_utf8(bytes).map_err(|err| TransferError::Protocol(err.to_string()))
}

/// Header of a request sent to a worker process.
#[derive(Debug, PartialEq, Eq)]
pub struct ReqHeader {
    /// The sequence number of the request.
    pub seq: u64,
    /// The operation type of the request.
    pub req_type: ReqType,
    /// The length of the request body.
    pub len: u64,
}

/// The request type of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqType {
    List,
    Store,
    Retrieve,
}

impl ReqType {
    pub fn from_u8(op: u8) -> Result<Self, TransferError> {
        match op {
            0 => Ok(Self::List),
            1 => Ok(Self::Store),
            2 => Ok(Self::Retrieve),
            _ => Err(TransferError::Protocol(format!(
                "Invalid operation type: {}",
                op
            ))),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::List => 0,
            Self::Store => 1,
            Self::Retrieve => 2,
        }
    }
}

impl Encode for ReqHeader {
    fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(REQ_HEADER_SIZE);
        bytes.extend(self.seq.to_be_bytes());
        bytes.push(self.req_type.to_u8());
        bytes.extend(self.len.to_be_bytes());
        bytes
    }
}

impl Decode for ReqHeader {
    fn decode(buf: &[u8]) -> Result<Self, TransferError> {
        if buf.len() < REQ_HEADER_SIZE {
            return Err(TransferError::Protocol("Insufficient bytes".to_string()));
        }
        Ok(Self {
            seq: read_u64(buf, 0)?,
            req_type: ReqType::from_u8(buf[8])?,
            len: read_u64(buf, 9)?,
        })
    }
}

/// Header of a reply sent back by a worker process.
#[derive(Debug, PartialEq, Eq)]
pub struct RespHeader {
    /// The sequence number of the request this reply answers.
    pub seq: u64,
    /// The kind of reply.
    pub resp_type: RespType,
    /// The length of the reply body.
    pub len: u64,
}

/// The reply type of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespType {
    Listing,
    Stored,
    Content,
    NotFound,
    Failed,
}

impl RespType {
    pub fn from_u8(op: u8) -> Result<Self, TransferError> {
        match op {
            0 => Ok(Self::Listing),
            1 => Ok(Self::Stored),
            2 => Ok(Self::Content),
            3 => Ok(Self::NotFound),
            4 => Ok(Self::Failed),
            _ => Err(TransferError::Protocol(format!(
                "Invalid response type: {}",
                op
            ))),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Listing => 0,
            Self::Stored => 1,
            Self::Content => 2,
            Self::NotFound => 3,
            Self::Failed => 4,
        }
    }
}

impl Encode for RespHeader {
    fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(RESP_HEADER_SIZE);
        bytes.extend(self.seq.to_be_bytes());
        bytes.push(self.resp_type.to_u8());
        bytes.extend(self.len.to_be_bytes());
        bytes
    }
}

impl Decode for RespHeader {
    fn decode(buf: &[u8]) -> Result<Self, TransferError> {
        if buf.len() < RESP_HEADER_SIZE {
            return Err(TransferError::Protocol("Insufficient bytes".to_string()));
        }
        Ok(Self {
            seq: read_u64(buf, 0)?,
            resp_type: RespType::from_u8(buf[8])?,
            len: read_u64(buf, 9)?,
        })
    }
}

/// Encode a request packet, header and body.
///
/// A store body is the filename length (u32), the filename and the raw data.
pub fn encode_request(seq: u64, op: &WorkerOp) -> Vec<u8> {
    let (req_type, body) = match op {
        WorkerOp::List => (ReqType::List, Vec::new()),
        WorkerOp::Store { filename, data } => {
            let mut body = Vec::with_capacity(4 + filename.len() + data.len());
            body.extend((filename.len() as u32).to_be_bytes());
            body.extend(filename.as_bytes());
            body.extend(data);
            (ReqType::Store, body)
        }
        WorkerOp::Retrieve { filename } => (ReqType::Retrieve, filename.as_bytes().to_vec()),
    };
    let header = ReqHeader {
        seq,
        req_type,
        len: body.len() as u64,
    };
    let mut packet = header.encode();
    packet.extend(body);
    packet
}

/// Decode a request body received after its header.
pub fn decode_request_body(req_type: ReqType, mut body: Vec<u8>) -> Result<WorkerOp, TransferError> {
    match req_type {
        ReqType::List => Ok(WorkerOp::List),
        ReqType::Store => {
            let name_len = read_u32(&body, 0)? as usize;
            if body.len() < 4 + name_len {
                return Err(TransferError::Protocol("Insufficient bytes".to_string()));
            }
            let data = body.split_off(4 + name_len);
            let filename = utf8(body.split_off(4))?;
            Ok(WorkerOp::Store { filename, data })
        }
        ReqType::Retrieve => Ok(WorkerOp::Retrieve {
            filename: utf8(body)?,
        }),
    }
}

/// Encode a reply packet, header and body.
pub fn encode_reply(seq: u64, reply: &WorkerReply) -> Vec<u8> {
    let (resp_type, body): (RespType, &[u8]) = match reply {
        WorkerReply::Listing(text) => (RespType::Listing, text.as_bytes()),
        WorkerReply::Stored => (RespType::Stored, &[][..]),
        WorkerReply::Content(data) => (RespType::Content, data.as_slice()),
        WorkerReply::NotFound => (RespType::NotFound, &[][..]),
        WorkerReply::Failed(message) => (RespType::Failed, message.as_bytes()),
    };
    let header = RespHeader {
        seq,
        resp_type,
        len: body.len() as u64,
    };
    let mut packet = header.encode();
    packet.extend_from_slice(body);
    packet
}

/// Decode a reply body received after its header.
pub fn decode_reply_body(resp_type: RespType, body: Vec<u8>) -> Result<WorkerReply, TransferError> {
    Ok(match resp_type {
        RespType::Listing => WorkerReply::Listing(utf8(body)?),
        RespType::Stored => WorkerReply::Stored,
        RespType::Content => WorkerReply::Content(body),
        RespType::NotFound => WorkerReply::NotFound,
        RespType::Failed => WorkerReply::Failed(utf8(body)?),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_store_request_layout() {
        let op = WorkerOp::Store {
            filename: "a.bin".to_string(),
            data: vec![9, 8, 7],
        };
        let packet = encode_request(42, &op);
        assert_eq!(packet.len(), REQ_HEADER_SIZE + 4 + 5 + 3);

        let header = ReqHeader::decode(&packet[..REQ_HEADER_SIZE]).unwrap();
        assert_eq!(
            header,
            ReqHeader {
                seq: 42,
                req_type: ReqType::Store,
                len: 12
            }
        );
        let body = packet[REQ_HEADER_SIZE..].to_vec();
        assert_eq!(decode_request_body(header.req_type, body).unwrap(), op);
    }

    #[test]
    fn test_reply_with_content() {
        let reply = WorkerReply::Content(b"payload".to_vec());
        let packet = encode_reply(7, &reply);
        let header = RespHeader::decode(&packet).unwrap();
        assert_eq!(header.seq, 7);
        assert_eq!(header.resp_type, RespType::Content);
        let body = packet[RESP_HEADER_SIZE..].to_vec();
        assert_eq!(decode_reply_body(header.resp_type, body).unwrap(), reply);
    }

    #[test]
    fn test_rejects_truncated_and_unknown() {
        assert!(ReqHeader::decode(&[0u8; 5]).is_err());
        let mut header = ReqHeader {
            seq: 1,
            req_type: ReqType::List,
            len: 0,
        }
        .encode();
        header[8] = 99;
        assert!(ReqHeader::decode(&header).is_err());
        assert!(decode_request_body(ReqType::Store, vec![0, 0, 0, 10, b'a']).is_err());
    }
}
