use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use tracing::instrument;

/// Single-pass decoder over a byte slice.
///
/// The decoder keeps a cursor into the input rather than pulling from a
/// stream: metainfo parsing needs the exact byte span of the `info`
/// sub-value (see [`raw_dict_value`]), which only a positioned decoder can
/// report.
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Byte offset of the cursor into the input.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn bump(&mut self) -> BencodeResult<u8> {
        let b = self.peek().ok_or(BencodeError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(b)
    }

    fn read(&mut self, len: usize) -> BencodeResult<&'a [u8]> {
        let remaining = self.data.len() - self.pos;
        if len > remaining {
            return Err(BencodeError::LengthMismatch {
                declared: len,
                remaining,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Reads up to (and consumes) `delimiter`, returning the bytes before it.
    fn read_until(&mut self, delimiter: u8) -> BencodeResult<&'a [u8]> {
        let rel = self.data[self.pos..]
            .iter()
            .position(|&b| b == delimiter)
            .ok_or(BencodeError::UnexpectedEnd)?;
        let slice = &self.data[self.pos..self.pos + rel];
        self.pos += rel + 1;
        Ok(slice)
    }

    /// Decodes the next value at the cursor.
    pub fn decode_value(&mut self) -> BencodeResult<BencodeValue> {
        let first_byte = self.peek().ok_or(BencodeError::UnexpectedEnd)?;
        match first_byte {
            b'0'..=b'9' => self.decode_string().map(BencodeValue::String),
            b'i' => self.decode_integer().map(BencodeValue::Integer),
            b'l' => self.decode_list().map(BencodeValue::List),
            b'd' => self.decode_dict().map(BencodeValue::Dict),
            other => Err(BencodeError::InvalidToken(other, self.pos)),
        }
    }

    /// `<len>:<bytes>`
    fn decode_string(&mut self) -> BencodeResult<Vec<u8>> {
        let length_str = self.read_until(b':')?;
        let length = std::str::from_utf8(length_str)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(BencodeError::InvalidInteger)?;
        Ok(self.read(length)?.to_vec())
    }

    /// `i<digits>e`. Rejects empty literals, `-0`, and leading zeros.
    fn decode_integer(&mut self) -> BencodeResult<i64> {
        self.bump()?; // consume 'i'
        let num_str = std::str::from_utf8(self.read_until(b'e')?)
            .map_err(|_| BencodeError::InvalidInteger)?;

        if num_str.is_empty() || num_str == "-0" {
            return Err(BencodeError::InvalidInteger);
        }
        if num_str.len() > 1 && num_str.starts_with('0') {
            return Err(BencodeError::InvalidInteger);
        }

        num_str
            .parse::<i64>()
            .map_err(|_| BencodeError::InvalidInteger)
    }

    /// `l<items>e`
    fn decode_list(&mut self) -> BencodeResult<Vec<BencodeValue>> {
        self.bump()?; // consume 'l'
        let mut list = Vec::new();
        loop {
            match self.peek().ok_or(BencodeError::UnexpectedEnd)? {
                b'e' => {
                    self.pos += 1;
                    return Ok(list);
                }
                _ => list.push(self.decode_value()?),
            }
        }
    }

    /// `d<key><value>...e`. Entry order is preserved as it appears on the
    /// wire.
    fn decode_dict(&mut self) -> BencodeResult<Vec<(Vec<u8>, BencodeValue)>> {
        self.bump()?; // consume 'd'
        let mut entries = Vec::new();
        loop {
            match self.peek().ok_or(BencodeError::UnexpectedEnd)? {
                b'e' => {
                    self.pos += 1;
                    return Ok(entries);
                }
                b'0'..=b'9' => {
                    let key = self.decode_string()?;
                    let value = self.decode_value()?;
                    entries.push((key, value));
                }
                other => return Err(BencodeError::InvalidToken(other, self.pos)),
            }
        }
    }
}

/// Decodes a single bencoded value from `data`.
#[instrument(skip(data), level = "trace")]
pub fn decode(data: &[u8]) -> BencodeResult<BencodeValue> {
    Decoder::new(data).decode_value()
}

/// Returns the raw byte span of the value stored under `key` in a top-level
/// bencoded dictionary, or `None` if the key is absent.
///
/// The span is the value exactly as it appeared on the wire. Hashing this
/// slice (rather than a re-encoding of the parsed value) is what keeps the
/// info-hash stable across parser representations.
#[instrument(skip(data, key), level = "trace")]
pub fn raw_dict_value<'a>(data: &'a [u8], key: &[u8]) -> BencodeResult<Option<&'a [u8]>> {
    let mut decoder = Decoder::new(data);
    match decoder.bump()? {
        b'd' => {}
        other => return Err(BencodeError::InvalidToken(other, 0)),
    }
    loop {
        match decoder.peek().ok_or(BencodeError::UnexpectedEnd)? {
            b'e' => return Ok(None),
            _ => {
                let entry_key = decoder.decode_string()?;
                let start = decoder.position();
                decoder.decode_value()?;
                if entry_key == key {
                    return Ok(Some(&data[start..decoder.position()]));
                }
            }
        }
    }
}
