//! Extraction of the RFC 9728 `resource_metadata` parameter from a
//! `WWW-Authenticate` header.
//!
//! The header arrives from an untrusted server, so the scanner is single-pass
//! and bounded: total length, URL length and whitespace runs are capped.

use crate::core::error::ValidationError;

pub const MAX_HEADER_LEN: usize = 4096;
pub const MAX_URL_LEN: usize = 2048;
pub const MAX_CONSECUTIVE_WHITESPACE: usize = 10;

const RESOURCE_METADATA_PARAM: &str = "resource_metadata";
const BEARER_SCHEME: &str = "bearer";

/// Returns the `resource_metadata` URL of the first `Bearer` challenge that
/// carries one, `Ok(None)` when no Bearer challenge advertises it.
pub fn parse_resource_metadata_url(header: &str) -> Result<Option<String>, ValidationError> {
    if header.len() > MAX_HEADER_LEN {
        return Err(ValidationError::HeaderTooLong { len: header.len() });
    }

    let mut cursor = Cursor::new(header);
    let mut in_bearer = false;

    loop {
        cursor.skip_separators()?;
        if cursor.at_end() {
            return Ok(None);
        }

        let name = cursor.token().ok_or_else(|| {
            ValidationError::MalformedWwwAuthenticate(format!(
                "unexpected character at offset {}",
                cursor.pos
            ))
        })?;
        cursor.skip_whitespace()?;

        if cursor.peek() == Some(b'=') {
            cursor.bump();
            // token68 padding such as `Negotiate abc==`
            while cursor.peek() == Some(b'=') {
                cursor.bump();
            }
            cursor.skip_whitespace()?;
            let value = match cursor.peek() {
                Some(b'"') => cursor.quoted()?,
                Some(b',') | None => String::new(),
                Some(_) => cursor.bare_value()?,
            };
            if in_bearer && name.eq_ignore_ascii_case(RESOURCE_METADATA_PARAM) {
                return validate_metadata_url(&value).map(Some);
            }
        } else {
            in_bearer = name.eq_ignore_ascii_case(BEARER_SCHEME);
        }
    }
}

/// Accepts only absolute http(s) URLs with a host, within [`MAX_URL_LEN`].
pub fn validate_metadata_url(value: &str) -> Result<String, ValidationError> {
    if value.len() > MAX_URL_LEN {
        return Err(ValidationError::InvalidUrl(format!(
            "resource metadata URL exceeds {MAX_URL_LEN} bytes"
        )));
    }
    let url = reqwest::Url::parse(value)
        .map_err(|err| ValidationError::InvalidUrl(format!("{value}: {err}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ValidationError::InvalidUrl(format!(
            "{value}: unsupported scheme {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ValidationError::InvalidUrl(format!("{value}: missing host")));
    }
    Ok(value.to_string())
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn skip_whitespace(&mut self) -> Result<(), ValidationError> {
        let mut run = 0;
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            run += 1;
            if run > MAX_CONSECUTIVE_WHITESPACE {
                return Err(ValidationError::MalformedWwwAuthenticate(format!(
                    "more than {MAX_CONSECUTIVE_WHITESPACE} consecutive whitespace characters"
                )));
            }
            self.bump();
        }
        Ok(())
    }

    fn skip_separators(&mut self) -> Result<(), ValidationError> {
        loop {
            self.skip_whitespace()?;
            if self.peek() == Some(b',') {
                self.bump();
            } else {
                return Ok(());
            }
        }
    }

    fn token(&mut self) -> Option<&'a str> {
        let input = self.input;
        let start = self.pos;
        while self.peek().is_some_and(is_tchar) {
            self.bump();
        }
        (self.pos > start).then(|| &input[start..self.pos])
    }

    fn bare_value(&mut self) -> Result<String, ValidationError> {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if byte == b',' || byte.is_ascii_whitespace() {
                break;
            }
            if self.pos - start >= MAX_URL_LEN {
                return Err(ValidationError::InvalidUrl(format!(
                    "parameter value exceeds {MAX_URL_LEN} bytes"
                )));
            }
            self.bump();
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn quoted(&mut self) -> Result<String, ValidationError> {
        self.bump();
        let input = self.input;
        let mut value = String::new();
        let mut chars = input[self.pos..].char_indices();
        while let Some((offset, ch)) = chars.next() {
            match ch {
                '"' => {
                    self.pos += offset + 1;
                    return Ok(value);
                }
                '\\' => match chars.next() {
                    Some((_, escaped)) => value.push(escaped),
                    None => break,
                },
                _ => value.push(ch),
            }
            if value.len() > MAX_URL_LEN {
                return Err(ValidationError::InvalidUrl(format!(
                    "parameter value exceeds {MAX_URL_LEN} bytes"
                )));
            }
        }
        Err(ValidationError::MalformedWwwAuthenticate(
            "unterminated quoted string".to_string(),
        ))
    }
}

fn is_tchar(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(
            byte,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
                | b'`' | b'|' | b'~'
        )
}
