//! Minimal CoAP (RFC 7252) codec: just enough of the wire format to
//! carry Thread's backbone resources. No block-wise transfer, no
//! observe, no proxy options — those are out of scope for what this
//! engine exchanges with peers.

use bbr_core::error::{BbrError, Result};

pub const OPTION_URI_PATH: u16 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoapType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl CoapType {
    fn as_bits(self) -> u8 {
        match self {
            CoapType::Confirmable => 0,
            CoapType::NonConfirmable => 1,
            CoapType::Acknowledgement => 2,
            CoapType::Reset => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => CoapType::Confirmable,
            1 => CoapType::NonConfirmable,
            2 => CoapType::Acknowledgement,
            _ => CoapType::Reset,
        }
    }
}

/// Method and response codes expressed as `class.detail`, matching how
/// CoAP code points are written in the RFC (e.g. `2.05`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoapCode {
    pub class: u8,
    pub detail: u8,
}

impl CoapCode {
    pub const EMPTY: Self = Self { class: 0, detail: 0 };
    pub const GET: Self = Self { class: 0, detail: 1 };
    pub const POST: Self = Self { class: 0, detail: 2 };
    pub const CHANGED: Self = Self { class: 2, detail: 4 };
    pub const CONTENT: Self = Self { class: 2, detail: 5 };
    pub const BAD_REQUEST: Self = Self { class: 4, detail: 0 };
    pub const NOT_FOUND: Self = Self { class: 4, detail: 4 };
    pub const INTERNAL_SERVER_ERROR: Self = Self { class: 5, detail: 0 };

    fn as_u8(self) -> u8 {
        (self.class << 5) | (self.detail & 0x1F)
    }

    fn from_u8(v: u8) -> Self {
        Self { class: v >> 5, detail: v & 0x1F }
    }

    pub fn is_success(self) -> bool {
        self.class == 2
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub msg_type: CoapType,
    pub code: CoapCode,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl CoapMessage {
    pub fn new_request(msg_type: CoapType, code: CoapCode, message_id: u16, path: &str) -> Self {
        let options = path
            .split('/')
            .filter(|seg| !seg.is_empty())
            .map(|seg| CoapOption { number: OPTION_URI_PATH, value: seg.as_bytes().to_vec() })
            .collect();
        Self { msg_type, code, message_id, token: Vec::new(), options, payload: Vec::new() }
    }

    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = token;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Reconstruct the `/a/b/c`-style path from the Uri-Path options,
    /// in the order they appeared on the wire.
    pub fn uri_path(&self) -> String {
        let segments: Vec<&str> = self
            .options
            .iter()
            .filter(|o| o.number == OPTION_URI_PATH)
            .filter_map(|o| std::str::from_utf8(&o.value).ok())
            .collect();
        format!("/{}", segments.join("/"))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.token.len() + self.payload.len() + 16);
        let tkl = self.token.len() as u8;
        out.push((1 << 6) | (self.msg_type.as_bits() << 4) | (tkl & 0x0F));
        out.push(self.code.as_u8());
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token);

        let mut sorted_options = self.options.clone();
        sorted_options.sort_by_key(|o| o.number);
        let mut prev_number = 0u16;
        for option in &sorted_options {
            let delta = option.number - prev_number;
            prev_number = option.number;
            encode_option(&mut out, delta, &option.value);
        }

        if !self.payload.is_empty() {
            out.push(0xFF);
            out.extend_from_slice(&self.payload);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(BbrError::Transport("CoAP message shorter than 4-byte header".into()));
        }
        let version = data[0] >> 6;
        if version != 1 {
            return Err(BbrError::Transport(format!("unsupported CoAP version {version}")));
        }
        let msg_type = CoapType::from_bits((data[0] >> 4) & 0x03);
        let tkl = (data[0] & 0x0F) as usize;
        if tkl > 8 {
            return Err(BbrError::Transport("token length exceeds 8 bytes".into()));
        }
        let code = CoapCode::from_u8(data[1]);
        let message_id = u16::from_be_bytes([data[2], data[3]]);

        let mut cursor = 4usize;
        if data.len() < cursor + tkl {
            return Err(BbrError::Transport("truncated token".into()));
        }
        let token = data[cursor..cursor + tkl].to_vec();
        cursor += tkl;

        let mut options = Vec::new();
        let mut option_number = 0u16;
        while cursor < data.len() {
            if data[cursor] == 0xFF {
                cursor += 1;
                let payload = data[cursor..].to_vec();
                return Ok(Self { msg_type, code, message_id, token, options, payload });
            }
            let (option, consumed) = decode_option(&data[cursor..], option_number)?;
            option_number = option.number;
            cursor += consumed;
            options.push(option);
        }
        Ok(Self { msg_type, code, message_id, token, options, payload: Vec::new() })
    }
}

fn encode_option(out: &mut Vec<u8>, delta: u16, value: &[u8]) {
    let (delta_nibble, delta_ext) = nibble_and_extended(delta);
    let (len_nibble, len_ext) = nibble_and_extended(value.len() as u16);
    out.push((delta_nibble << 4) | len_nibble);
    out.extend_from_slice(&delta_ext);
    out.extend_from_slice(&len_ext);
    out.extend_from_slice(value);
}

fn nibble_and_extended(n: u16) -> (u8, Vec<u8>) {
    if n < 13 {
        (n as u8, Vec::new())
    } else if n < 269 {
        (13, vec![(n - 13) as u8])
    } else {
        let ext = n - 269;
        (14, ext.to_be_bytes().to_vec())
    }
}

fn decode_option(data: &[u8], prev_number: u16) -> Result<(CoapOption, usize)> {
    if data.is_empty() {
        return Err(BbrError::Transport("truncated option header".into()));
    }
    let delta_nibble = data[0] >> 4;
    let len_nibble = data[0] & 0x0F;
    let mut cursor = 1usize;

    let delta = read_extended(data, &mut cursor, delta_nibble)?;
    let length = read_extended(data, &mut cursor, len_nibble)? as usize;

    if data.len() < cursor + length {
        return Err(BbrError::Transport("option value runs past message end".into()));
    }
    let value = data[cursor..cursor + length].to_vec();
    cursor += length;

    Ok((CoapOption { number: prev_number + delta, value }, cursor))
}

fn read_extended(data: &[u8], cursor: &mut usize, nibble: u8) -> Result<u16> {
    match nibble {
        13 => {
            if data.len() < *cursor + 1 {
                return Err(BbrError::Transport("truncated extended option".into()));
            }
            let v = data[*cursor] as u16 + 13;
            *cursor += 1;
            Ok(v)
        }
        14 => {
            if data.len() < *cursor + 2 {
                return Err(BbrError::Transport("truncated extended option".into()));
            }
            let v = u16::from_be_bytes([data[*cursor], data[*cursor + 1]]) + 269;
            *cursor += 2;
            Ok(v)
        }
        15 => Err(BbrError::Transport("reserved option nibble 15".into())),
        n => Ok(n as u16),
    }
}
