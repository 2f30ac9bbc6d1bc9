//! Padding: decoy headers prepended to every probe to stress the HPACK
//! and QPACK table handling of both parsers on the path.

use crate::headers::{Header, Headers};
use std::fmt;

pub const PADDING_HEADER_COUNT: usize = 100;

const UNICODE_NAME: &str = r"¯\_(ツ)_/¯";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingMethod {
    None,
    UnicodeSame,
    UnicodeDifferent,
    AsciiSame,
    AsciiDifferent,
    Cookie,
}

pub const PADDING_METHODS: [PaddingMethod; 6] = [
    PaddingMethod::None,
    PaddingMethod::UnicodeSame,
    PaddingMethod::UnicodeDifferent,
    PaddingMethod::AsciiSame,
    PaddingMethod::AsciiDifferent,
    PaddingMethod::Cookie,
];

impl PaddingMethod {
    pub fn headers(&self) -> Headers {
        let mut headers = Headers::new();
        match self {
            PaddingMethod::None => {}

            PaddingMethod::UnicodeSame => {
                for _ in 0..PADDING_HEADER_COUNT {
                    headers.push(Header::new(UNICODE_NAME, "val"));
                }
            }

            PaddingMethod::UnicodeDifferent => {
                for i in 0..PADDING_HEADER_COUNT {
                    headers.push(Header::new(format!("{}-{}", UNICODE_NAME, i), "val"));
                }
            }

            PaddingMethod::AsciiSame => {
                for _ in 0..PADDING_HEADER_COUNT {
                    headers.push(Header::new("header", "val"));
                }
            }

            PaddingMethod::AsciiDifferent => {
                for i in 0..PADDING_HEADER_COUNT {
                    headers.push(Header::new(format!("header-{}", i), "val"));
                }
            }

            PaddingMethod::Cookie => {
                for i in 0..PADDING_HEADER_COUNT {
                    headers.push(Header::new("cookie", format!("cookie{}=value{}", i, i)));
                }
            }
        }
        headers
    }
}

impl fmt::Display for PaddingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaddingMethod::None => "no padding headers",
            PaddingMethod::UnicodeSame => "pad with same unicode header",
            PaddingMethod::UnicodeDifferent => "pad with different unicode headers",
            PaddingMethod::AsciiSame => "pad with same ASCII header",
            PaddingMethod::AsciiDifferent => "pad with different ASCII headers",
            PaddingMethod::Cookie => "pad with cookie headers",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn counts_and_uniqueness() {
        assert!(PaddingMethod::None.headers().is_empty());
        for method in [
            PaddingMethod::UnicodeSame,
            PaddingMethod::UnicodeDifferent,
            PaddingMethod::AsciiSame,
            PaddingMethod::AsciiDifferent,
            PaddingMethod::Cookie,
        ] {
            assert_eq!(method.headers().len(), PADDING_HEADER_COUNT);
        }

        let distinct: HashSet<Vec<u8>> = PaddingMethod::UnicodeDifferent
            .headers()
            .iter()
            .map(|h| h.name.clone())
            .collect();
        assert_eq!(distinct.len(), PADDING_HEADER_COUNT);

        let same: HashSet<Vec<u8>> = PaddingMethod::AsciiSame
            .headers()
            .iter()
            .map(|h| h.name.clone())
            .collect();
        assert_eq!(same.len(), 1);

        let cookies = PaddingMethod::Cookie.headers();
        assert!(cookies.iter().all(|h| h.name == b"cookie"));
        let values: HashSet<Vec<u8>> = cookies.iter().map(|h| h.value.clone()).collect();
        assert_eq!(values.len(), PADDING_HEADER_COUNT);
    }

    #[test]
    fn unicode_names_are_not_ascii() {
        assert!(PaddingMethod::UnicodeSame
            .headers()
            .iter()
            .all(|h| h.name.iter().any(|&b| b >= 0x80)));
    }
}
