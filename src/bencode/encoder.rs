use super::BencodeResult;
use super::BencodeValue;
use std::io::Write;
use tracing::instrument;

fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

// Entries are written in insertion order; a decoded dictionary therefore
// re-encodes to the exact input bytes. Callers building dictionaries for the
// wire are responsible for inserting keys in sorted order.
fn encode_dict<W: Write>(writer: &mut W, entries: &[(Vec<u8>, BencodeValue)]) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    for (key, value) in entries {
        encode_string(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(entries) => encode_dict(writer, entries),
    }
}

#[instrument(skip(writer, value), level = "trace")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

/// Encodes `value` into a fresh buffer.
pub fn encode_to_vec(value: &BencodeValue) -> Vec<u8> {
    let mut buffer = Vec::new();
    // Writing into a Vec cannot fail.
    encode_value(&mut buffer, value).unwrap_or_default();
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decode;

    #[test]
    fn encodes_integer() {
        assert_eq!(encode_to_vec(&BencodeValue::Integer(123)), b"i123e");
        assert_eq!(encode_to_vec(&BencodeValue::Integer(-7)), b"i-7e");
    }

    #[test]
    fn encodes_string() {
        assert_eq!(
            encode_to_vec(&BencodeValue::String(b"middle err".to_vec())),
            b"10:middle err"
        );
    }

    #[test]
    fn encodes_nested_structure() {
        let value = BencodeValue::Dict(vec![
            (b"a".to_vec(), BencodeValue::Integer(123)),
            (
                b"b".to_vec(),
                BencodeValue::Dict(vec![
                    (b"ba".to_vec(), BencodeValue::String(b"foo".to_vec())),
                    (b"bb".to_vec(), BencodeValue::String(b"bar".to_vec())),
                ]),
            ),
            (
                b"c".to_vec(),
                BencodeValue::List(vec![
                    BencodeValue::List(vec![
                        BencodeValue::String(b"a".to_vec()),
                        BencodeValue::String(b"b".to_vec()),
                    ]),
                    BencodeValue::String(b"z".to_vec()),
                ]),
            ),
        ]);
        assert_eq!(
            encode_to_vec(&value),
            b"d1:ai123e1:bd2:ba3:foo2:bb3:bare1:cll1:a1:be1:zee".to_vec()
        );
    }

    #[test]
    fn round_trips_wire_bytes() {
        // Keys deliberately not in sorted order: insertion order must win.
        for input in [
            b"d3:cow3:moo4:spam4:eggse".as_slice(),
            b"d2:ee3:mgo2:cf5:redise".as_slice(),
            b"l4:spam4:eggsi123ee".as_slice(),
            b"i123e".as_slice(),
        ] {
            let decoded = decode(input).unwrap();
            assert_eq!(encode_to_vec(&decoded), input);
        }
    }
}
