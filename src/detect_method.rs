//! Detect methods: each one produces a (valid, invalid) request pair that
//! differs in a single legality-affecting detail, with the smuggling
//! transform applied on top.

use crate::headers::{Header, Headers};
use crate::smuggle::{SmugglingMethod, SmugglingVariant};
use std::fmt;
use std::time::Duration;

/// Delay between the header block and the trailing body fragment in the
/// zero-body-fragment probe.
const BODY_FRAGMENT_DELAY: Duration = Duration::from_millis(500);

/// What a detect method asks the wire engine to send.
#[derive(Debug, Clone, Default)]
pub struct DetectRequestParams {
    pub additional_headers: Headers,
    pub body: Vec<Vec<u8>>,
    pub body_parts_delay: Duration,
    pub skip_body_end_flag: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectMethod {
    ContentLengthParsing,
    ChunkedBodyValidation,
    ChunkedBodyConsumption,
    ZeroBodyFragment,
}

pub const DETECT_METHODS: [DetectMethod; 4] = [
    DetectMethod::ChunkedBodyConsumption,
    DetectMethod::ChunkedBodyValidation,
    DetectMethod::ContentLengthParsing,
    DetectMethod::ZeroBodyFragment,
];

impl DetectMethod {
    /// Builds the probe pair. `path` feeds the path-based smuggling
    /// transform.
    pub fn requests(
        &self,
        sm: SmugglingMethod,
        path: &str,
        variant: &SmugglingVariant,
    ) -> (DetectRequestParams, DetectRequestParams) {
        let mut valid = DetectRequestParams::default();
        let mut invalid = DetectRequestParams::default();

        match self {
            DetectMethod::ContentLengthParsing => {
                let mut valid_header = Header::new("content-length", "1");
                let mut invalid_header = Header::new("content-length", "-1");
                sm.smuggle(&mut valid_header, path, variant);
                sm.smuggle(&mut invalid_header, path, variant);
                valid.additional_headers.push(valid_header);
                invalid.additional_headers.push(invalid_header);
            }

            DetectMethod::ChunkedBodyValidation => {
                let headers = chunked_headers(sm, path, variant);
                valid.additional_headers = headers.clone();
                invalid.additional_headers = headers;
                valid.body = vec![b"0\r\n\r\n".to_vec()];
                invalid.body = vec![b"X\r\n\r\n".to_vec()];
            }

            DetectMethod::ChunkedBodyConsumption => {
                let headers = chunked_headers(sm, path, variant);
                valid.additional_headers = headers.clone();
                invalid.additional_headers = headers;
                valid.body = vec![b"0\r\n\r\n".to_vec()];
                // Declares 0x999 bytes and never delivers them: a server
                // honoring transfer-encoding keeps waiting.
                invalid.body = vec![b"999\r\n".to_vec()];
            }

            DetectMethod::ZeroBodyFragment => {
                valid.body = vec![Vec::new()];
                invalid.body = vec![Vec::new()];
                valid.body_parts_delay = BODY_FRAGMENT_DELAY;
                invalid.body_parts_delay = BODY_FRAGMENT_DELAY;
                invalid.skip_body_end_flag = true;
            }
        }

        (valid, invalid)
    }

    /// Filters (detect, smuggling) pairs that cannot test anything.
    pub fn allows(&self, sm: SmugglingMethod) -> bool {
        match self {
            // Plain content-length values are legal on both sides, so an
            // unsmuggled pair tests nothing; and neither "content-length"
            // nor its values contain a letter the unicode transform can
            // substitute.
            DetectMethod::ContentLengthParsing => {
                sm != SmugglingMethod::None && sm != SmugglingMethod::Unicode
            }
            DetectMethod::ChunkedBodyValidation | DetectMethod::ChunkedBodyConsumption => true,
            // The probe pair differs only in the end-stream flag; any
            // header mutation on top would blur what is being measured.
            DetectMethod::ZeroBodyFragment => sm == SmugglingMethod::None,
        }
    }
}

fn chunked_headers(sm: SmugglingMethod, path: &str, variant: &SmugglingVariant) -> Headers {
    let mut te = Header::new("transfer-encoding", "chunked");
    sm.smuggle(&mut te, path, variant);
    Headers(vec![Header::new("content-length", "5"), te])
}

impl fmt::Display for DetectMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DetectMethod::ContentLengthParsing => "detect content length parsing",
            DetectMethod::ChunkedBodyValidation => "detect chunked body validation",
            DetectMethod::ChunkedBodyConsumption => "detect chunked body consumption",
            DetectMethod::ZeroBodyFragment => "detect zero body fragment handling",
        };
        f.write_str(s)
    }
}
