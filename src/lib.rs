// h2smuggle core library
//
// Probes HTTP/2 and HTTP/3 origins behind HTTP/1.1 intermediaries for
// request-smuggling discrepancies: deliberately malformed request pairs
// are emitted at the frame level and the response populations compared.

pub mod detect;
pub mod detect_method;
pub mod dns_cache;
pub mod error;
pub mod headers;
pub mod hpack;
pub mod http2;
pub mod http3;
pub mod huffman;
pub mod log_writer;
pub mod padding;
pub mod qpack;
pub mod request;
pub mod response_set;
pub mod scheduler;
pub mod smuggle;
