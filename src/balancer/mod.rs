mod sticky;
mod weighted;

pub use sticky::{cookie_token, default_cookie_name, StickyCookie};
pub use weighted::WeightedRoundRobin;

use hyper::Request;

/// Weighted selection with optional cookie-based session affinity.
///
/// Each item is registered under a key (server URL or service name) whose
/// hashed form is the cookie value.
pub struct Balancer<T> {
    wrr: WeightedRoundRobin<Member<T>>,
    sticky: Option<StickyCookie>,
}

pub struct Member<T> {
    pub key: String,
    pub token: String,
    pub item: T,
}

/// Result of a selection. `set_cookie` holds the value to send back when a
/// new session has to be issued.
pub struct Pick<'a, T> {
    pub index: usize,
    pub member: &'a Member<T>,
    pub set_cookie: Option<&'a str>,
}

impl<T> Balancer<T> {
    pub fn new(members: impl IntoIterator<Item = (String, T, u32)>, sticky: Option<StickyCookie>) -> Self {
        let wrr = WeightedRoundRobin::new(members.into_iter().map(|(key, item, weight)| {
            let token = cookie_token(&key);
            (Member { key, token, item }, weight)
        }));

        Self { wrr, sticky }
    }

    /// Choose the member for `req`.
    ///
    /// A valid affinity cookie pointing at an available member wins. A
    /// missing, stale or unknown cookie falls back to weighted selection and
    /// a fresh cookie is issued.
    pub fn pick<B>(&self, req: &Request<B>) -> Option<Pick<'_, T>> {
        let Some(sticky) = &self.sticky else {
            return self.wrr.next().map(|(index, member)| Pick {
                index,
                member,
                set_cookie: None,
            });
        };

        if let Some(value) = sticky.value_of(req) {
            if let Some(index) = self.wrr.position(|m| m.token == value) {
                if self.wrr.is_available(index) {
                    if let Some(member) = self.wrr.get(index) {
                        return Some(Pick {
                            index,
                            member,
                            set_cookie: None,
                        });
                    }
                }
            }
        }

        self.wrr.next().map(|(index, member)| Pick {
            index,
            member,
            set_cookie: Some(member.token.as_str()),
        })
    }

    pub fn sticky(&self) -> Option<&StickyCookie> {
        self.sticky.as_ref()
    }

    /// Mark the member registered under `key` up or down.
    pub fn set_up(&self, key: &str, up: bool) -> bool {
        match self.wrr.position(|m| m.key == key) {
            Some(index) => {
                self.wrr.set_up(index, up);
                true
            }
            None => false,
        }
    }

    pub fn members(&self) -> impl Iterator<Item = &Member<T>> {
        self.wrr.iter()
    }

    pub fn len(&self) -> usize {
        self.wrr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wrr.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::Cookie;
    use hyper::header::COOKIE;

    fn sticky() -> Option<StickyCookie> {
        Some(StickyCookie::new(
            &Cookie {
                name: "lb".into(),
                ..Default::default()
            },
            "app@file",
        ))
    }

    fn members(urls: &[(&str, u32)]) -> Vec<(String, &'static str, u32)> {
        urls.iter().map(|(u, w)| (u.to_string(), "handler", *w)).collect()
    }

    fn with_cookie(value: &str) -> Request<()> {
        Request::builder()
            .header(COOKIE, format!("lb={}", value))
            .body(())
            .unwrap()
    }

    #[test]
    fn test_without_sticky_never_sets_cookie() {
        let balancer = Balancer::new(members(&[("http://a:80", 1), ("http://b:80", 1)]), None);
        let req = Request::builder().body(()).unwrap();
        let pick = balancer.pick(&req).unwrap();
        assert!(pick.set_cookie.is_none());
    }

    #[test]
    fn test_sticky_cookie_pins_member() {
        let balancer = Balancer::new(members(&[("http://a:80", 1), ("http://b:80", 1)]), sticky());
        let token_b = cookie_token("http://b:80");

        for _ in 0..5 {
            let pick = balancer.pick(&with_cookie(&token_b)).unwrap();
            assert_eq!(pick.member.key, "http://b:80");
            assert!(pick.set_cookie.is_none());
        }
    }

    #[test]
    fn test_first_request_issues_cookie() {
        let balancer = Balancer::new(members(&[("http://a:80", 1)]), sticky());
        let req = Request::builder().body(()).unwrap();
        let pick = balancer.pick(&req).unwrap();
        assert_eq!(pick.set_cookie, Some(cookie_token("http://a:80").as_str()));
    }

    #[test]
    fn test_stale_cookie_falls_back_and_reissues() {
        // B was removed from the service: the new balancer no longer knows it.
        let stale = cookie_token("http://b:80");
        let balancer = Balancer::new(members(&[("http://a:80", 1), ("http://c:80", 1)]), sticky());

        let pick = balancer.pick(&with_cookie(&stale)).unwrap();
        assert_ne!(pick.member.key, "http://b:80");
        let issued = pick.set_cookie.unwrap();
        assert_eq!(issued, pick.member.token);
        assert!(["http://a:80", "http://c:80"].contains(&pick.member.key.as_str()));
    }

    #[test]
    fn test_cookie_to_down_member_is_ignored() {
        let balancer = Balancer::new(members(&[("http://a:80", 1), ("http://b:80", 1)]), sticky());
        assert!(balancer.set_up("http://b:80", false));

        let pick = balancer.pick(&with_cookie(&cookie_token("http://b:80"))).unwrap();
        assert_eq!(pick.member.key, "http://a:80");
        assert!(pick.set_cookie.is_some());
    }

    #[test]
    fn test_set_up_unknown_key() {
        let balancer = Balancer::new(members(&[("http://a:80", 1)]), None);
        assert!(!balancer.set_up("http://zzz:80", false));
    }
}
