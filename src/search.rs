//! Search request parsing, filter fingerprinting and the search handler.

use crate::ber::{self, Class, Kind, Packet, Value};
use crate::event::{self, EventLog};
use crate::ldap_handler::{AuthState, Outcome, RequestHandler, Session};
use crate::ldap_protocol::{self, check_packet, ResultCode, APP_SEARCH_REQUEST};
use crate::response::{search_result_done, SearchResultEntry};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Pseudo attribute name used when the filter is not a plain equality match.
pub const FINGERPRINT_ATTR: &str = "searchFingerprint";

const FILTER_EQUALITY: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<i64> for SearchScope {
    type Error = SearchParseError;
    fn try_from(value: i64) -> Result<Self, SearchParseError> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => Err(SearchParseError::Malformed(format!("invalid search scope: {}", value))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefAliases {
    Never = 0,
    InSearching = 1,
    FindingBaseObj = 2,
    Always = 3,
}

impl TryFrom<i64> for DerefAliases {
    type Error = SearchParseError;
    fn try_from(value: i64) -> Result<Self, SearchParseError> {
        match value {
            0 => Ok(DerefAliases::Never),
            1 => Ok(DerefAliases::InSearching),
            2 => Ok(DerefAliases::FindingBaseObj),
            3 => Ok(DerefAliases::Always),
            _ => Err(SearchParseError::Malformed(format!("invalid derefAliases: {}", value))),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SearchParseError {
    #[error("not a search request")]
    NotASearchRequest,
    #[error("malformed search request: {0}")]
    Malformed(String),
}

/// Simplified search request. Size and time limits are recorded, not enforced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_dn: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i64,
    pub time_limit: i64,
    pub types_only: bool,
    /// Equality attribute, or `searchFingerprint` for any other filter.
    pub filter_attr: String,
    pub filter_value: String,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn is_fingerprint(&self) -> bool {
        self.filter_attr == FINGERPRINT_ATTR
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Comma-joined pre-order rendering of every non-empty scalar under `nodes`.
pub fn filter_fingerprint(nodes: &[Packet]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut stack: Vec<&Packet> = nodes.iter().rev().collect();
    while let Some(node) = stack.pop() {
        if let Some(value) = node.value() {
            let text = scalar_text(value);
            if !text.is_empty() {
                parts.push(text);
            }
        }
        stack.extend(node.children().iter().rev());
    }
    parts.join(",")
}

fn expect_integer(node: &Packet, tag: u32, field: &str) -> Result<i64, SearchParseError> {
    check_packet(node, Class::Universal, Kind::Primitive, tag)
        .map_err(|e| SearchParseError::Malformed(format!("{}: {}", field, e)))?;
    node.as_integer()
        .ok_or_else(|| SearchParseError::Malformed(format!("{} is not an integer", field)))
}

fn equality_filter(filter: &Packet) -> Result<(String, String), SearchParseError> {
    match (filter.child(0).and_then(Packet::as_string), filter.child(1).and_then(Packet::as_string)) {
        (Some(attr), Some(value)) => Ok((attr, value)),
        _ => Err(SearchParseError::Malformed(
            "equality filter needs an attribute and a value".to_string(),
        )),
    }
}

/// Parse the protocolOp of a search request envelope.
pub fn parse_search_request(packet: &Packet) -> Result<SearchRequest, SearchParseError> {
    let op = packet.child(1).ok_or(SearchParseError::NotASearchRequest)?;
    check_packet(op, Class::Application, Kind::Constructed, APP_SEARCH_REQUEST)
        .map_err(|_| SearchParseError::NotASearchRequest)?;

    let rps = op.children();
    if rps.len() < 7 {
        return Err(SearchParseError::Malformed(format!(
            "at least 7 elements required, found {}",
            rps.len()
        )));
    }

    check_packet(&rps[0], Class::Universal, Kind::Primitive, ber::TAG_OCTET_STRING)
        .map_err(|e| SearchParseError::Malformed(format!("baseObject: {}", e)))?;
    let base_dn = rps[0].as_string().unwrap_or_default();
    let scope = SearchScope::try_from(expect_integer(&rps[1], ber::TAG_ENUMERATED, "scope")?)?;
    let deref_aliases =
        DerefAliases::try_from(expect_integer(&rps[2], ber::TAG_ENUMERATED, "derefAliases")?)?;
    let size_limit = expect_integer(&rps[3], ber::TAG_INTEGER, "sizeLimit")?;
    let time_limit = expect_integer(&rps[4], ber::TAG_INTEGER, "timeLimit")?;
    check_packet(&rps[5], Class::Universal, Kind::Primitive, ber::TAG_BOOLEAN)
        .map_err(|e| SearchParseError::Malformed(format!("typesOnly: {}", e)))?;
    let types_only = rps[5]
        .as_bool()
        .ok_or_else(|| SearchParseError::Malformed("typesOnly is not a boolean".to_string()))?;

    let (filter_attr, filter_value) =
        if check_packet(&rps[6], Class::Context, Kind::Constructed, FILTER_EQUALITY).is_ok() {
            equality_filter(&rps[6])?
        } else {
            (FINGERPRINT_ATTR.to_string(), filter_fingerprint(&rps[6..]))
        };

    let attributes = rps
        .get(7)
        .map(|list| list.children().iter().filter_map(Packet::as_string).collect())
        .unwrap_or_default();

    Ok(SearchRequest {
        base_dn,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter_attr,
        filter_value,
        attributes,
    })
}

/// Produces believable results for a search.
///
/// `None` declines the request; `Some(vec![])` means "no such object".
pub trait SearchFunc: Send + Sync {
    fn search(&self, request: &SearchRequest, auth: AuthState) -> Option<Vec<SearchResultEntry>>;
}

impl<F> SearchFunc for F
where
    F: Fn(&SearchRequest, AuthState) -> Option<Vec<SearchResultEntry>> + Send + Sync,
{
    fn search(&self, request: &SearchRequest, auth: AuthState) -> Option<Vec<SearchResultEntry>> {
        self(request, auth)
    }
}

pub struct SearchHandler {
    search: Arc<dyn SearchFunc>,
}

impl SearchHandler {
    pub fn new(search: Arc<dyn SearchFunc>) -> Self {
        Self { search }
    }
}

impl RequestHandler for SearchHandler {
    fn name(&self) -> &'static str {
        "search"
    }

    fn handle(&self, packet: &Packet, session: &mut Session, log: &mut EventLog) -> Outcome {
        let request = match parse_search_request(packet) {
            Ok(request) => request,
            Err(SearchParseError::NotASearchRequest) => return Outcome::NotMine,
            Err(e) => {
                debug!("{}", e);
                log.insert(event::REQUEST_TYPE, "search");
                if let Some(op) = packet.child(1) {
                    log.insert(event::MALFORMED_PAYLOAD, ber::encode(op));
                }
                return Outcome::NotMine;
            }
        };

        log.insert(event::REQUEST_TYPE, "search");
        log.insert(event::SEARCH_BASE_DN, request.base_dn.as_str());
        log.insert(event::SEARCH_SCOPE, request.scope as i64);
        log.insert(event::SEARCH_FILTER_ATTR, request.filter_attr.as_str());
        log.insert(event::SEARCH_FILTER_VALUE, request.filter_value.as_str());
        if !request.attributes.is_empty() {
            log.insert(event::SEARCH_ATTRIBUTES, request.attributes.join(","));
        }
        debug!(
            "Search base={:?} scope={:?} filter {}={:?} as {:?}",
            request.base_dn, request.scope, request.filter_attr, request.filter_value, session.auth
        );

        let Some(entries) = self.search.search(&request, session.auth) else {
            return Outcome::NotMine;
        };

        let id = match ldap_protocol::message_id(packet) {
            Ok(id) => id,
            Err(e) => {
                debug!("Failed to extract message id: {}", e);
                return Outcome::NotMine;
            }
        };

        if entries.is_empty() {
            return Outcome::Handled(vec![search_result_done(id, ResultCode::NoSuchObject)]);
        }

        let mut packets: Vec<Packet> = entries
            .iter()
            .map(|entry| entry.to_packet(id, request.types_only))
            .collect();
        packets.push(search_result_done(id, ResultCode::Success));
        Outcome::Handled(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventValue;
    use crate::ldap_handler::TlsState;
    use crate::ldap_protocol::{APP_SEARCH_RESULT_DONE, APP_SEARCH_RESULT_ENTRY};

    fn session(auth: AuthState) -> Session {
        let mut s = Session::new("127.0.0.1:1".parse().unwrap(), None, TlsState::Unavailable);
        s.auth = auth;
        s
    }

    fn context_str(tag: u32, s: &str) -> Packet {
        Packet::primitive(Class::Context, tag, Value::Bytes(s.as_bytes().to_vec()))
    }

    fn equality(attr: &str, value: &str) -> Packet {
        Packet::constructed(
            Class::Context,
            FILTER_EQUALITY,
            vec![Packet::octet_string(attr), Packet::octet_string(value)],
        )
    }

    fn search(id: i64, base: &str, scope: i64, filter: Packet, attrs: &[&str]) -> Packet {
        Packet::sequence(vec![
            Packet::integer(id),
            Packet::constructed(
                Class::Application,
                APP_SEARCH_REQUEST,
                vec![
                    Packet::octet_string(base),
                    Packet::enumerated(scope),
                    Packet::enumerated(0),
                    Packet::integer(0),
                    Packet::integer(0),
                    Packet::boolean(false),
                    filter,
                    Packet::sequence(attrs.iter().map(|a| Packet::octet_string(*a)).collect()),
                ],
            ),
        ])
    }

    fn codes(outcome: &Outcome) -> Vec<(u32, Option<i64>)> {
        let Outcome::Handled(packets) = outcome else {
            panic!("expected a response");
        };
        packets
            .iter()
            .map(|p| {
                let op = p.child(1).unwrap();
                (op.tag, if op.tag == APP_SEARCH_RESULT_DONE { op.child(0).unwrap().as_integer() } else { None })
            })
            .collect()
    }

    #[test]
    fn test_parse_equality_filter() {
        let p = search(3, "dc=example,dc=com", 2, equality("uid", "alice"), &["cn", "mail"]);
        let req = parse_search_request(&p).unwrap();
        assert_eq!(req.base_dn, "dc=example,dc=com");
        assert_eq!(req.scope, SearchScope::WholeSubtree);
        assert_eq!(req.deref_aliases, DerefAliases::Never);
        assert!(!req.types_only);
        assert_eq!(req.filter_attr, "uid");
        assert_eq!(req.filter_value, "alice");
        assert_eq!(req.attributes, vec!["cn", "mail"]);
        assert!(!req.is_fingerprint());
    }

    #[test]
    fn test_parse_complex_filter_fingerprint() {
        // (&(objectClass=*)(|(uid=admin)(cn=adm*)))
        let filter = Packet::constructed(
            Class::Context,
            0,
            vec![
                context_str(7, "objectClass"),
                Packet::constructed(
                    Class::Context,
                    1,
                    vec![
                        equality("uid", "admin"),
                        Packet::constructed(
                            Class::Context,
                            4,
                            vec![
                                Packet::octet_string("cn"),
                                Packet::sequence(vec![context_str(0, "adm")]),
                            ],
                        ),
                    ],
                ),
            ],
        );
        let p = search(4, "", 0, filter, &["namingContexts"]);
        let req = parse_search_request(&p).unwrap();
        assert!(req.is_fingerprint());
        assert_eq!(req.filter_attr, "searchFingerprint");
        // Trailing attribute list is part of the fingerprint
        assert_eq!(req.filter_value, "objectClass,uid,admin,cn,adm,namingContexts");
        assert_eq!(req.scope, SearchScope::BaseObject);
    }

    #[test]
    fn test_fingerprint_rendering_and_determinism() {
        let nodes = vec![
            Packet::constructed(
                Class::Context,
                0,
                vec![
                    Packet::integer(5),
                    Packet::primitive(Class::Universal, ber::TAG_NULL, Value::Null),
                    Packet::boolean(true),
                    Packet::octet_string(""),
                    Packet::sequence(vec![Packet::octet_string("deep")]),
                ],
            ),
            Packet::sequence(vec![]),
            Packet::octet_string("tail"),
        ];
        let first = filter_fingerprint(&nodes);
        assert_eq!(first, "5,true,deep,tail");
        assert_eq!(filter_fingerprint(&nodes), first);
        assert_eq!(filter_fingerprint(&[]), "");
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        let short = Packet::sequence(vec![
            Packet::integer(1),
            Packet::constructed(Class::Application, APP_SEARCH_REQUEST, vec![Packet::octet_string("")]),
        ]);
        assert!(matches!(parse_search_request(&short), Err(SearchParseError::Malformed(_))));

        let bad_scope = search(1, "", 9, equality("cn", "x"), &[]);
        assert!(matches!(parse_search_request(&bad_scope), Err(SearchParseError::Malformed(_))));

        let bad_equality = search(
            1,
            "",
            0,
            Packet::constructed(Class::Context, FILTER_EQUALITY, vec![Packet::octet_string("cn")]),
            &[],
        );
        assert!(matches!(parse_search_request(&bad_equality), Err(SearchParseError::Malformed(_))));

        let bind = Packet::sequence(vec![
            Packet::integer(1),
            Packet::constructed(Class::Application, 0, vec![]),
        ]);
        assert_eq!(parse_search_request(&bind), Err(SearchParseError::NotASearchRequest));
    }

    #[test]
    fn test_handler_no_results_is_no_such_object() {
        let handler = SearchHandler::new(Arc::new(|_: &SearchRequest, _: AuthState| Some(vec![])));
        let mut log = EventLog::new();
        let out = handler.handle(
            &search(9, "dc=x", 2, equality("uid", "nobody"), &[]),
            &mut session(AuthState::User),
            &mut log,
        );
        assert_eq!(codes(&out), vec![(APP_SEARCH_RESULT_DONE, Some(32))]);
        assert_eq!(log.get(event::SEARCH_BASE_DN), Some(&EventValue::Text("dc=x".into())));
        assert_eq!(log.get(event::SEARCH_FILTER_ATTR), Some(&EventValue::Text("uid".into())));
        assert_eq!(log.get(event::SEARCH_FILTER_VALUE), Some(&EventValue::Text("nobody".into())));
    }

    #[test]
    fn test_handler_n_results_plus_done() {
        let handler = SearchHandler::new(Arc::new(|req: &SearchRequest, auth: AuthState| {
            assert_eq!(auth, AuthState::Admin);
            Some(vec![
                SearchResultEntry::new(format!("cn={},dc=x", req.filter_value)).with("cn", req.filter_value.as_str()),
                SearchResultEntry::new("cn=other,dc=x").with("cn", "other"),
            ])
        }));
        let out = handler.handle(
            &search(10, "dc=x", 2, equality("cn", "a"), &[]),
            &mut session(AuthState::Admin),
            &mut EventLog::new(),
        );
        assert_eq!(
            codes(&out),
            vec![(APP_SEARCH_RESULT_ENTRY, None), (APP_SEARCH_RESULT_ENTRY, None), (APP_SEARCH_RESULT_DONE, Some(0))]
        );
        let Outcome::Handled(packets) = out else { unreachable!() };
        for p in &packets {
            assert_eq!(ldap_protocol::message_id(p).unwrap(), 10);
        }
    }

    #[test]
    fn test_handler_declines_but_still_logs() {
        let handler = SearchHandler::new(Arc::new(|_: &SearchRequest, _: AuthState| None));
        let mut log = EventLog::new();
        let out = handler.handle(
            &search(11, "ou=secret", 1, equality("cn", "x"), &[]),
            &mut session(AuthState::Anonymous),
            &mut log,
        );
        assert_eq!(out, Outcome::NotMine);
        assert_eq!(log.get(event::SEARCH_BASE_DN), Some(&EventValue::Text("ou=secret".into())));
        assert!(!log.contains_key(event::MALFORMED_PAYLOAD));
    }

    #[test]
    fn test_handler_marks_malformed() {
        let handler = SearchHandler::new(Arc::new(|_: &SearchRequest, _: AuthState| Some(vec![])));
        let mut log = EventLog::new();
        let out = handler.handle(
            &search(12, "", 7, equality("cn", "x"), &[]),
            &mut session(AuthState::Anonymous),
            &mut log,
        );
        assert_eq!(out, Outcome::NotMine);
        assert!(log.contains_key(event::MALFORMED_PAYLOAD));
        assert!(!log.contains_key(event::SEARCH_BASE_DN));
    }
}
