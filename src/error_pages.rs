use bytes::Bytes;
use pingora_http::ResponseHeader;

/// Result of rendering an error page
pub struct ErrorPageResponse {
    pub header: ResponseHeader,
    pub body: Bytes,
}

/// Generate the built-in last-resort error page.
///
/// The fallback cascade bottoms out at the on-disk system 404/500
/// documents; this generator only answers when even those cannot be read,
/// so the process can always produce a response.
pub fn builtin_error_page(status_code: u16) -> ErrorPageResponse {
    let reason = status_reason(status_code);
    let body = format!(
        "<!DOCTYPE html>\n<html><head><title>{} {}</title></head>\n<body>\n<center><h1>{} {}</h1></center>\n<hr><center>vhost-router</center>\n</body></html>\n",
        status_code, reason, status_code, reason
    );

    let mut resp = ResponseHeader::build(status_code, Some(3)).unwrap();
    let _ = resp.insert_header(http::header::CONTENT_TYPE, "text/html; charset=utf-8");
    let _ = resp.insert_header(http::header::CONTENT_LENGTH, body.len());

    ErrorPageResponse {
        header: resp,
        body: Bytes::from(body),
    }
}

/// Get a human-readable reason for the status codes the router produces
fn status_reason(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Error",
    }
}
