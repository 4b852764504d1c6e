use super::bencode::Bencode;
use std::collections::BTreeMap;
use std::io;

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn eof(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, format!("EOF while parsing {}", what))
}

/// Decodes one value starting at `*pos`, advancing `pos` past it.
pub fn decode(input: &[u8], pos: &mut usize) -> io::Result<Bencode> {
    if *pos >= input.len() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF reached"));
    }
    match input[*pos] {
        b'i' => {
            *pos += 1;
            let num = read_until(input, pos, b'e', "integer")?;
            let num = num
                .parse::<i64>()
                .map_err(|e| invalid(format!("Invalid integer format: {}", e)))?;
            Ok(Bencode::Int(num))
        }
        b'l' => {
            *pos += 1;
            let mut list = Vec::new();
            while *pos < input.len() && input[*pos] != b'e' {
                let item = decode(input, pos).map_err(|e| {
                    invalid(format!("Failed to decode list item at pos {}: {}", *pos, e))
                })?;
                list.push(item);
            }
            if *pos >= input.len() {
                return Err(eof("list"));
            }
            *pos += 1;
            Ok(Bencode::List(list))
        }
        b'd' => {
            *pos += 1;
            let mut dict = BTreeMap::new();
            while *pos < input.len() && input[*pos] != b'e' {
                let key = match decode(input, pos) {
                    Ok(Bencode::Bytes(b)) => b,
                    Ok(_) => return Err(invalid("dict key must be bytes".to_string())),
                    Err(e) => {
                        return Err(invalid(format!(
                            "Failed to decode dict key at pos {}: {}",
                            *pos, e
                        )));
                    }
                };
                let val = decode(input, pos).map_err(|e| {
                    invalid(format!("Failed to decode dict value at pos {}: {}", *pos, e))
                })?;
                dict.insert(key, val);
            }
            if *pos >= input.len() {
                return Err(eof("dict"));
            }
            *pos += 1;
            Ok(Bencode::Dict(dict))
        }
        b'0'..=b'9' => {
            let len = read_until(input, pos, b':', "string length")?;
            let len = len
                .parse::<usize>()
                .map_err(|e| invalid(format!("Invalid string length format: {}", e)))?;
            let end = pos
                .checked_add(len)
                .filter(|end| *end <= input.len())
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::UnexpectedEof, "String length exceeds input")
                })?;
            let bytes = input[*pos..end].to_vec();
            *pos = end;
            Ok(Bencode::Bytes(bytes))
        }
        c => Err(invalid(format!(
            "invalid bencode char: '{}' at pos {}",
            c as char, *pos
        ))),
    }
}

/// Decodes a complete buffer, rejecting trailing bytes.
pub fn decode_all(input: &[u8]) -> io::Result<Bencode> {
    let mut pos = 0;
    let value = decode(input, &mut pos)?;
    if pos != input.len() {
        return Err(invalid(format!("{} trailing bytes", input.len() - pos)));
    }
    Ok(value)
}

// Reads ASCII up to `delim` and leaves `pos` just past it.
fn read_until<'a>(
    input: &'a [u8],
    pos: &mut usize,
    delim: u8,
    what: &str,
) -> io::Result<&'a str> {
    let start = *pos;
    while *pos < input.len() && input[*pos] != delim {
        *pos += 1;
    }
    if *pos >= input.len() {
        return Err(eof(what));
    }
    let text = std::str::from_utf8(&input[start..*pos])
        .map_err(|e| invalid(format!("Invalid UTF-8 in {}: {}", what, e)))?;
    *pos += 1;
    Ok(text)
}
