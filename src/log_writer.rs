//! Append-only CSV sink for probe results, safe for concurrent workers.

use crate::detect::DetectParams;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

const HEADER: [&str; 7] = [
    "target",
    "http_method",
    "detect_method",
    "padding_method",
    "smuggling_method",
    "smuggling_variant",
    "result",
];

pub struct CsvLogWriter {
    inner: Mutex<Inner>,
}

struct Inner {
    file: File,
    header_written: bool,
}

impl CsvLogWriter {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(CsvLogWriter {
            inner: Mutex::new(Inner {
                file,
                header_written: false,
            }),
        })
    }

    /// Writes the header row once, then one record per call. The lock
    /// spans the header check and the record so rows never interleave.
    pub fn log(&self, params: &DetectParams, result: &str) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.header_written {
            write_record(&mut inner.file, &HEADER)?;
            inner.header_written = true;
        }
        let detect_method = params.detect_method.to_string();
        let padding_method = params.padding_method.to_string();
        let smuggling_method = params.smuggling_method.to_string();
        let smuggling_variant = params.smuggling_variant.to_string();
        let record: [&str; 7] = [
            &params.target,
            &params.request_method,
            &detect_method,
            &padding_method,
            &smuggling_method,
            &smuggling_variant,
            result,
        ];
        write_record(&mut inner.file, &record)
    }
}

fn write_record<W: Write>(w: &mut W, fields: &[impl AsRef<str>]) -> io::Result<()> {
    let mut line = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&quote_field(field.as_ref()));
    }
    line.push('\n');
    w.write_all(line.as_bytes())?;
    w.flush()
}

/// RFC 4180 quoting; variant strings legitimately contain commas, quotes
/// and raw newlines.
fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        let mut quoted = String::with_capacity(field.len() + 2);
        quoted.push('"');
        for c in field.chars() {
            if c == '"' {
                quoted.push('"');
            }
            quoted.push(c);
        }
        quoted.push('"');
        quoted
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_fields_pass_through() {
        let mut buf = Vec::new();
        write_record(&mut buf, &["a", "b", "c"]).unwrap();
        assert_eq!(buf, b"a,b,c\n");
    }

    #[test]
    fn special_characters_are_quoted() {
        let mut buf = Vec::new();
        write_record(&mut buf, &["a,b", "say \"hi\"", "x\r\ny"]).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "\"a,b\",\"say \"\"hi\"\"\",\"x\r\ny\"\n"
        );
    }
}
