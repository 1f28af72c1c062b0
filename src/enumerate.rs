//! WQL enumeration against remote WMI namespaces.
//!
//! An [`Enumerator`] runs WQL queries over WS-Management enumeration:
//! one Enumerate request (with `OptimizeEnumeration`, so the first batch
//! of instances rides the EnumerateResponse) followed by Pull requests
//! until the server reports `EndOfSequence`. Response bodies go through
//! the streaming parsers chunk by chunk; the whole result set is only
//! materialized as the typed instance list the caller receives.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::config::ConnectionInfo;
use crate::error::{WinRmError, WinRmResult};
use crate::parser::{EnumerationPage, Instance, ParserKind};
use crate::registry::HostRegistry;
use crate::soap::{wmi_resource_uri, EnvelopeFactory};
use crate::transport::{HttpSender, SoapReply, WsmanSender};

/// Default number of instances requested per page.
pub const DEFAULT_MAX_ELEMENTS: u32 = 100;

/// Pull count after which a non-terminating enumeration is abandoned. A
/// server that keeps handing out context tokens without ever sending
/// `EndOfSequence` would otherwise loop forever.
const MAX_PULLS: usize = 10_000;

// ============================================================================
// Query Description
// ============================================================================

/// One WQL query against a WMI namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnumInfo {
    /// WMI namespace, e.g. `root\cimv2`
    pub namespace: String,
    /// WQL query text
    pub query: String,
}

impl EnumInfo {
    /// Describe a WQL query against the given WMI namespace.
    pub fn wmi(namespace: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            query: query.into(),
        }
    }

    /// Enumeration resource URI for this query's namespace.
    pub fn resource_uri(&self) -> String {
        wmi_resource_uri(&self.namespace)
    }

    /// Class named in the query's `FROM` clause. Instance elements in the
    /// response carry this name.
    pub fn target_class(&self) -> WinRmResult<String> {
        let mut tokens = self.query.split_whitespace();
        while let Some(token) = tokens.next() {
            if token.eq_ignore_ascii_case("from") {
                return tokens.next().map(str::to_string).ok_or_else(|| {
                    WinRmError::InvalidParameter(format!(
                        "WQL query names no class after FROM: {}",
                        self.query
                    ))
                });
            }
        }
        Err(WinRmError::InvalidParameter(format!(
            "WQL query has no FROM clause: {}",
            self.query
        )))
    }
}

impl fmt::Display for EnumInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.query, self.namespace)
    }
}

// ============================================================================
// Enumeration Client
// ============================================================================

/// Runs WQL enumerations against one host.
pub struct Enumerator {
    sender: Arc<dyn WsmanSender>,
    factory: EnvelopeFactory,
    host: String,
    parser_kind: ParserKind,
    max_elements: u32,
}

impl Enumerator {
    /// Create an enumerator over an existing sender.
    pub fn new(sender: Arc<dyn WsmanSender>, info: &ConnectionInfo) -> Self {
        Self {
            sender,
            factory: EnvelopeFactory::new(info),
            host: info.hostname().to_string(),
            parser_kind: ParserKind::default(),
            max_elements: DEFAULT_MAX_ELEMENTS,
        }
    }

    /// Create an enumerator with its own HTTP transport.
    pub fn connect(info: ConnectionInfo, registry: Arc<HostRegistry>) -> WinRmResult<Self> {
        let sender = Arc::new(HttpSender::new(info.clone(), registry)?);
        Ok(Self::new(sender, &info))
    }

    /// Select the parser backend for response bodies.
    pub fn with_parser_kind(mut self, kind: ParserKind) -> Self {
        self.parser_kind = kind;
        self
    }

    /// Override the page size requested from the server.
    pub fn with_max_elements(mut self, max_elements: u32) -> Self {
        self.max_elements = max_elements;
        self
    }

    /// Run one query to completion, walking Enumerate and Pull until the
    /// server reports `EndOfSequence`.
    pub async fn enumerate(&self, info: &EnumInfo) -> WinRmResult<Vec<Instance>> {
        let class = info.target_class()?;
        let resource_uri = info.resource_uri();
        debug!(
            host = %self.host,
            namespace = %info.namespace,
            query = %info.query,
            "Starting enumeration"
        );

        let envelope = self.factory.enumerate(
            Uuid::new_v4(),
            &resource_uri,
            &info.query,
            self.max_elements,
        )?;
        let reply = self.sender.send(&envelope).await?;
        let mut page = self.parse_page(&class, &reply)?;

        let mut instances = std::mem::take(&mut page.instances);
        let mut pulls = 0usize;
        while !page.end_of_sequence {
            let context = page.context.take().ok_or_else(|| {
                WinRmError::MalformedResponse(
                    "response carried neither an enumeration context nor EndOfSequence"
                        .to_string(),
                )
            })?;
            pulls += 1;
            if pulls > MAX_PULLS {
                return Err(WinRmError::MalformedResponse(format!(
                    "enumeration did not terminate within {MAX_PULLS} pulls"
                )));
            }

            let envelope =
                self.factory
                    .pull(Uuid::new_v4(), &resource_uri, &context, self.max_elements)?;
            let reply = self.sender.send(&envelope).await?;
            page = self.parse_page(&class, &reply)?;
            instances.append(&mut page.instances);
        }

        debug!(
            host = %self.host,
            query = %info.query,
            instances = instances.len(),
            pulls,
            "Enumeration complete"
        );
        Ok(instances)
    }

    /// Run several queries in order, returning the results keyed by
    /// query. Stops at the first failure; partial results are dropped.
    pub async fn enumerate_all(
        &self,
        queries: &[EnumInfo],
    ) -> WinRmResult<IndexMap<EnumInfo, Vec<Instance>>> {
        let mut results = IndexMap::with_capacity(queries.len());
        for info in queries {
            let instances = self.enumerate(info).await?;
            results.insert(info.clone(), instances);
        }
        Ok(results)
    }

    /// Cheap connectivity probe: send an Identify request and verify the
    /// server answers with an IdentifyResponse.
    pub async fn check_connection(&self) -> WinRmResult<()> {
        let envelope = self.factory.identify(Uuid::new_v4());
        let reply = self.sender.send(&envelope).await?;
        if reply.body_string().contains("IdentifyResponse") {
            debug!(host = %self.host, "Identify succeeded");
            Ok(())
        } else {
            Err(WinRmError::MalformedResponse(
                "identify answer carried no IdentifyResponse".to_string(),
            ))
        }
    }

    fn parse_page(&self, class: &str, reply: &SoapReply) -> WinRmResult<EnumerationPage> {
        let mut parser = self.parser_kind.create(class);
        for chunk in reply.chunks() {
            parser.feed(chunk)?;
        }
        parser.finish()
    }
}
