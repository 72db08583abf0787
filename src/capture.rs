//! Status capture for the access log.
//!
//! Every response leaves the pipeline through [`ResponseCapture::commit`],
//! which stamps the common headers and records the final status. The access
//! log reads the status from here and nowhere else.

use std::time::SystemTime;

use http::header::{DATE, HeaderValue};
use http::StatusCode;

use crate::enrich::{REQUEST_ID, X_REQUEST_ID};
use crate::response::Response;

pub(crate) struct ResponseCapture {
    status: StatusCode,
}

impl ResponseCapture {
    pub(crate) fn new() -> Self {
        Self { status: StatusCode::OK }
    }

    /// Stamps `Date` and the correlation headers, then records the status.
    ///
    /// `x_request_id` is echoed only when the client sent one.
    pub(crate) fn commit(
        &mut self,
        res: &mut Response,
        request_id: &HeaderValue,
        x_request_id: Option<HeaderValue>,
    ) {
        if let Ok(date) = HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now())) {
            res.headers.insert(DATE, date);
        }
        res.headers.insert(REQUEST_ID, request_id.clone());
        if let Some(x) = x_request_id {
            res.headers.insert(X_REQUEST_ID, x);
        }
        self.status = res.status;
    }

    /// The committed status, or `200` if nothing was committed.
    pub(crate) fn status(&self) -> StatusCode {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_ok() {
        let capture = ResponseCapture::new();
        assert_eq!(capture.status(), StatusCode::OK);
    }

    #[test]
    fn records_status_and_stamps_headers() {
        let mut capture = ResponseCapture::new();
        let mut res = Response::status(StatusCode::IM_A_TEAPOT);

        capture.commit(&mut res, &HeaderValue::from_static("id-1"), None);

        assert_eq!(capture.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(res.headers()[REQUEST_ID], "id-1");
        assert!(res.headers().contains_key(DATE));
        assert!(!res.headers().contains_key(X_REQUEST_ID));
    }

    #[test]
    fn echoes_client_x_request_id() {
        let mut capture = ResponseCapture::new();
        let mut res = Response::text("ok");

        capture.commit(
            &mut res,
            &HeaderValue::from_static("abc"),
            Some(HeaderValue::from_static("abc")),
        );

        assert_eq!(res.headers()[X_REQUEST_ID], "abc");
    }
}
