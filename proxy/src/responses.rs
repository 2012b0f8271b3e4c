use rama_http::Body;
use rama_http::HeaderValue;
use rama_http::Response;
use rama_http::StatusCode;
use rama_http::header;
use serde::Serialize;
use tracing::error;

pub fn text_response(status: StatusCode, body: &str) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::from(body.to_string())))
}

pub fn json_response<T: Serialize>(value: &T) -> Response {
    let body = match serde_json::to_string(value) {
        Ok(body) => body,
        Err(err) => {
            error!("failed to serialize JSON response: {err}");
            "{}".to_string()
        }
    };
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|err| {
            error!("failed to build JSON response: {err}");
            Response::new(Body::from("{}"))
        })
}

/// The response for hard-blocked sites. The connection is not reused.
pub fn hard_block_response() -> Response {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header(header::CONNECTION, HeaderValue::from_static("close"))
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Redirects a denied request to the self-service block page; the entry id
/// rides in the URL fragment so the page can resolve which rule tripped.
pub fn block_page_redirect(block_host: &str, entry_id: u32) -> Response {
    let location = format!("https://{block_host}/filter/blocked.html#{entry_id}");
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .header(header::CONNECTION, HeaderValue::from_static("close"))
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn hard_block_closes_the_connection() {
        let resp = hard_block_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            resp.headers().get(header::CONNECTION),
            Some(&HeaderValue::from_static("close"))
        );
    }

    #[test]
    fn block_page_redirect_carries_the_entry_id_fragment() {
        let resp = block_page_redirect("clarity.proxy", 3);
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "https://clarity.proxy/filter/blocked.html#3"
        );
        assert_eq!(
            resp.headers().get(header::CONNECTION),
            Some(&HeaderValue::from_static("close"))
        );
    }

    #[test]
    fn json_response_sets_content_type() {
        let resp = json_response(&serde_json::json!({"result": false}));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json"
        );
    }
}
