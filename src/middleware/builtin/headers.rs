use crate::config::dynamic::Headers;
use crate::proxy::{BoxFuture, BoxHandler, Handler, HandlerResult, HttpBody};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Request};

/// Sets or removes request and response headers.
/// An empty configured value removes the header.
pub struct HeadersMiddleware {
    request: HeaderEdits,
    response: HeaderEdits,
    next: BoxHandler,
}

#[derive(Default)]
struct HeaderEdits {
    set: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

impl HeaderEdits {
    fn parse<'a>(entries: impl Iterator<Item = (&'a String, &'a String)>) -> Result<Self, String> {
        let mut edits = HeaderEdits::default();
        for (k, v) in entries {
            let name = HeaderName::try_from(k.as_str()).map_err(|_| format!("invalid header name {:?}", k))?;
            if v.is_empty() {
                edits.remove.push(name);
            } else {
                let value = HeaderValue::from_str(v).map_err(|_| format!("invalid value for header {:?}", k))?;
                edits.set.push((name, value));
            }
        }
        Ok(edits)
    }

    #[inline]
    fn apply(&self, headers: &mut HeaderMap) {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
    }
}

impl HeadersMiddleware {
    pub fn new(config: &Headers, next: BoxHandler) -> Result<Self, String> {
        Ok(Self {
            request: HeaderEdits::parse(config.custom_request_headers.iter())?,
            response: HeaderEdits::parse(config.custom_response_headers.iter())?,
            next,
        })
    }
}

impl Handler for HeadersMiddleware {
    fn serve(&self, mut req: Request<HttpBody>) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            self.request.apply(req.headers_mut());
            let mut response = self.next.serve(req).await?;
            self.response.apply(response.headers_mut());
            Ok(response)
        })
    }
}
