// hdnea is the cdn's session token, it shows up as a query param on stream urls and as the
// __hdnea__ cookie on playlist responses. segments are rejected without it

pub const HDNEA_PARAM: &str = "hdnea=";
pub const HDNEA_COOKIE: &str = "__hdnea__";

/// value of the first hdnea= in a url or query string, up to the next '&'
pub fn extract_hdnea(url: &str) -> Option<String> {
    let start = url.find(HDNEA_PARAM)? + HDNEA_PARAM.len();
    let token = &url[start..];
    let token = match token.find('&') {
        Some(end) => &token[..end],
        None => token,
    };

    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// appends hdnea unless the url already carries one, empty urls stay empty
pub fn append_hdnea(url: &str, token: &str) -> String {
    if url.is_empty() || url.contains(HDNEA_PARAM) {
        return url.to_string();
    }

    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}{}", url, separator, HDNEA_PARAM, token)
}

/// pulls the token out of a `Set-Cookie: __hdnea__=...; path=/` header value
pub fn hdnea_from_set_cookie(header: &str) -> Option<String> {
    let rest = header.trim().strip_prefix(HDNEA_COOKIE)?.strip_prefix('=')?;
    let value = rest.split(';').next().unwrap_or_default().trim();

    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
