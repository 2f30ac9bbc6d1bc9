//! The detect loop: alternates valid and invalid probes against one
//! target and decides whether the server told them apart.

use crate::detect_method::DetectMethod;
use crate::dns_cache::DnsCache;
use crate::error::RequestError;
use crate::padding::PaddingMethod;
use crate::request::{send_request, RequestParams};
use crate::response_set::ResponseSet;
use crate::smuggle::{SmugglingMethod, SmugglingVariant};
use log::{debug, info};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Samples per probe; the loop stops earlier as soon as the two sides
/// stop being distinguishable.
const MAX_SAMPLES: usize = 14;

/// Attempts per sample while the failure stays transient.
const MAX_TRIES: usize = 3;

/// Identity of one probe. The string form is its display name in logs
/// and the CSV output.
#[derive(Debug, Clone)]
pub struct DetectParams {
    pub target: String,
    pub request_method: String,
    pub detect_method: DetectMethod,
    pub smuggling_method: SmugglingMethod,
    pub smuggling_variant: SmugglingVariant,
    pub padding_method: PaddingMethod,
}

impl DetectParams {
    /// Variant/method shape mismatches are programming errors and are
    /// rejected here, at construction.
    pub fn new(
        target: String,
        request_method: String,
        detect_method: DetectMethod,
        smuggling_method: SmugglingMethod,
        smuggling_variant: SmugglingVariant,
        padding_method: PaddingMethod,
    ) -> Self {
        assert!(
            smuggling_method.accepts(&smuggling_variant),
            "variant {:?} does not belong to {:?}",
            smuggling_variant,
            smuggling_method
        );
        DetectParams {
            target,
            request_method,
            detect_method,
            smuggling_method,
            smuggling_variant,
            padding_method,
        }
    }
}

impl fmt::Display for DetectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "target={}, http_method={}, detect_method={}, smuggling_method={}, \
             smuggling_variant={}, padding_method={}",
            self.target,
            self.request_method,
            self.detect_method,
            self.smuggling_method,
            self.smuggling_variant,
            self.padding_method
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectVerdict {
    Indistinguishable,
    DistinguishableNotByTiming,
    DistinguishableByTiming,
}

impl DetectVerdict {
    pub fn is_distinguishable(&self) -> bool {
        *self != DetectVerdict::Indistinguishable
    }
}

impl fmt::Display for DetectVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DetectVerdict::Indistinguishable => "indistinguishable",
            DetectVerdict::DistinguishableNotByTiming => "distinguishable",
            DetectVerdict::DistinguishableByTiming => "distinguishable by timing",
        };
        f.write_str(s)
    }
}

/// Shared per-run configuration handed to every worker.
pub struct DetectContext {
    pub dns: Arc<DnsCache>,
    pub connect_to: Option<String>,
    pub timeout: Duration,
}

/// The sampling schedule: V I, then alternating groups of three.
/// Interleaving cancels slow network drift and clustered failures.
pub fn sample_is_valid(i: usize) -> bool {
    i == 0 || (i >= 2 && ((i - 2) / 3) % 2 == 0)
}

/// Runs the full schedule for one probe and returns the verdict. Errors
/// only on conditions that doom the whole probe (bad target, bad scheme,
/// DNS failure); per-sample request failures are data, not errors.
pub fn detect(params: &DetectParams, ctx: &DetectContext) -> Result<DetectVerdict, RequestError> {
    let target = Url::parse(&params.target).map_err(|e| RequestError::InvalidTarget {
        target: params.target.clone(),
        reason: e.to_string(),
    })?;
    let path = match target.path() {
        "" => "/",
        p => p,
    };

    let (valid, invalid) = params.detect_method.requests(
        params.smuggling_method,
        path,
        &params.smuggling_variant,
    );
    let prefix_headers = params.padding_method.headers();

    let mut valid_responses = ResponseSet::new();
    let mut invalid_responses = ResponseSet::new();

    let mut i = 0;
    while i < MAX_SAMPLES && valid_responses.distinguishable_from(&invalid_responses) {
        let use_valid = sample_is_valid(i);
        let side = if use_valid { &valid } else { &invalid };

        let mut request = RequestParams::new(
            target.clone(),
            params.request_method.clone(),
            ctx.timeout,
        );
        request.connect_addr = ctx.connect_to.clone();
        request.headers = prefix_headers.combine(&side.additional_headers);
        request.body = side.body.clone();
        request.body_parts_delay = side.body_parts_delay;
        request.skip_body_end_flag = side.skip_body_end_flag;

        let mut tries_left = MAX_TRIES;
        let outcome = loop {
            let result = send_request(&request, &ctx.dns);
            tries_left -= 1;
            match result {
                Err(ref e) if e.is_transient() && tries_left > 0 => continue,
                other => break other,
            }
        };

        let set = if use_valid {
            &mut valid_responses
        } else {
            &mut invalid_responses
        };
        match outcome {
            Ok(response) => set.account(Some(&response), false),
            Err(
                e @ (RequestError::InvalidTarget { .. }
                | RequestError::InvalidScheme(_)
                | RequestError::Dns { .. }),
            ) => return Err(e),
            Err(e @ RequestError::ConnDrop(_)) => {
                debug!("request: {}, error: {}", params, e);
                set.account(None, false);
            }
            Err(e) => {
                info!("request: {}, error: {}", params, e);
                set.account(None, e.is_timeout());
            }
        }
        i += 1;
    }

    let verdict = if valid_responses.distinguishable_from(&invalid_responses) {
        if !valid_responses.has_non_timeout() || !invalid_responses.has_non_timeout() {
            DetectVerdict::DistinguishableByTiming
        } else {
            DetectVerdict::DistinguishableNotByTiming
        }
    } else {
        DetectVerdict::Indistinguishable
    };

    info!(
        "{}: valid={}, invalid={}, result={}",
        params, valid_responses, invalid_responses, verdict
    );
    Ok(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_interleaves_groups_of_three() {
        let valid_indices: Vec<usize> = (0..MAX_SAMPLES).filter(|&i| sample_is_valid(i)).collect();
        assert_eq!(valid_indices, vec![0, 2, 3, 4, 8, 9, 10]);
        let invalid_indices: Vec<usize> =
            (0..MAX_SAMPLES).filter(|&i| !sample_is_valid(i)).collect();
        assert_eq!(invalid_indices, vec![1, 5, 6, 7, 11, 12, 13]);
    }

    #[test]
    #[should_panic]
    fn mismatched_variant_rejected_at_construction() {
        DetectParams::new(
            "https://example.com/".to_string(),
            "GET".to_string(),
            DetectMethod::ContentLengthParsing,
            SmugglingMethod::Spaced,
            SmugglingVariant::None,
            PaddingMethod::None,
        );
    }

    #[test]
    fn params_display_names_every_axis() {
        let params = DetectParams::new(
            "https://example.com/".to_string(),
            "POST".to_string(),
            DetectMethod::ChunkedBodyConsumption,
            SmugglingMethod::Underscore,
            SmugglingVariant::None,
            PaddingMethod::None,
        );
        let s = params.to_string();
        assert!(s.starts_with("target=https://example.com/, http_method=POST"));
        assert!(s.contains("detect_method=detect chunked body consumption"));
        assert!(s.contains("smuggling_method=header smuggling via underscore"));
        assert!(s.contains("padding_method=no padding headers"));
    }

    #[test]
    fn bad_target_fails_the_probe() {
        let params = DetectParams::new(
            "not a url".to_string(),
            "GET".to_string(),
            DetectMethod::ChunkedBodyValidation,
            SmugglingMethod::None,
            SmugglingVariant::None,
            PaddingMethod::None,
        );
        let ctx = DetectContext {
            dns: Arc::new(DnsCache::new()),
            connect_to: None,
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            detect(&params, &ctx),
            Err(RequestError::InvalidTarget { .. })
        ));
    }

    #[test]
    fn bad_scheme_fails_the_probe() {
        let params = DetectParams::new(
            "http://example.com/".to_string(),
            "GET".to_string(),
            DetectMethod::ChunkedBodyValidation,
            SmugglingMethod::None,
            SmugglingVariant::None,
            PaddingMethod::None,
        );
        let ctx = DetectContext {
            dns: Arc::new(DnsCache::with_resolver(Box::new(|_| {
                Ok(vec!["127.0.0.1".parse().unwrap()])
            }))),
            connect_to: None,
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            detect(&params, &ctx),
            Err(RequestError::InvalidScheme(_))
        ));
    }
}
