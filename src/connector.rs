//! Accounting system connector.
//!
//! Owns the single external-system connection and its lifecycle:
//!
//! ```text
//! disconnected --connect()--> connecting --success--> connected
//! connecting --failure--> error --backoff--> disconnected
//! connected --fetch/probe failure--> error --backoff--> disconnected
//! connected --disconnect()--> disconnected
//! ```
//!
//! All transitions run under one async mutex, held across the connect
//! probe, so concurrent `connect()` calls collapse to a single in-flight
//! attempt. The company list is enumerated once per connection and cached
//! until disconnect. The wire protocol is Tally-style XML envelopes over
//! HTTP; responses are parsed leniently (control characters stripped,
//! unknown elements skipped) and field names are normalized through the
//! ordered alias tables here — nothing past this boundary sees variant
//! names.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AccountingConfig;
use crate::error::ConnectorError;
use crate::models::{Company, LedgerEntry, StockItem, Voucher};

/// Ordered aliases for the company name in a status response.
const COMPANY_NAME_ALIASES: &[&str] = &["COMPANYNAME", "NAME", "DSPCOMPANYNAME"];
/// Ordered aliases applied when normalizing ledger records.
const LEDGER_NAME_ALIASES: &[&str] = &["NAME", "LEDGERNAME", "DSPDISPNAME"];
const PARENT_ALIASES: &[&str] = &["PARENT", "GROUPNAME"];
const OPENING_ALIASES: &[&str] = &["OPENINGBALANCE", "OPENINGVALUE"];
const CLOSING_ALIASES: &[&str] = &["CLOSINGBALANCE", "CLOSINGVALUE", "AMOUNT"];

/// Cap on the poller's failure backoff.
const POLL_BACKOFF_CAP_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Result of `test_connection()` / the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub status: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct ConnInner {
    state: ConnectionState,
    companies: Vec<Company>,
    last_sync: Option<i64>,
    error_since: Option<Instant>,
    last_error: Option<String>,
}

impl ConnInner {
    fn mark_error(&mut self, reason: String) {
        self.state = ConnectionState::Error;
        self.error_since = Some(Instant::now());
        self.last_error = Some(reason);
        self.companies.clear();
    }

    /// `error` decays to `disconnected` once the backoff has elapsed.
    fn decay(&mut self, backoff: Duration) {
        if self.state == ConnectionState::Error {
            if let Some(since) = self.error_since {
                if since.elapsed() >= backoff {
                    self.state = ConnectionState::Disconnected;
                    self.error_since = None;
                }
            }
        }
    }
}

pub struct AccountingConnector {
    config: AccountingConfig,
    client: reqwest::Client,
    inner: Mutex<ConnInner>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl AccountingConnector {
    pub fn new(config: AccountingConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            inner: Mutex::new(ConnInner {
                state: ConnectionState::Disconnected,
                companies: Vec::new(),
                last_sync: None,
                error_since: None,
                last_error: None,
            }),
            poller: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> String {
        self.config.endpoint()
    }

    /// Current state, applying the error-decay transition.
    pub async fn state(&self) -> ConnectionState {
        let mut inner = self.inner.lock().await;
        inner.decay(Duration::from_secs(self.config.error_backoff_secs));
        inner.state
    }

    pub async fn last_sync(&self) -> Option<i64> {
        self.inner.lock().await.last_sync
    }

    /// Establish the connection and enumerate companies. The lock is held
    /// across the probe: a second concurrent `connect()` waits and then
    /// observes the settled state instead of launching its own attempt.
    pub async fn connect(&self) -> Result<ConnectionStatus, ConnectorError> {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Connected {
            return Ok(ConnectionStatus {
                status: ConnectionState::Connected,
                company_name: inner.companies.first().map(|c| c.name.clone()),
                last_error: None,
            });
        }

        inner.state = ConnectionState::Connecting;
        info!(endpoint = %self.endpoint(), "connecting to accounting system");

        match self.fetch_companies_raw().await {
            Ok(companies) => {
                let company_name = companies.first().map(|c| c.name.clone());
                inner.state = ConnectionState::Connected;
                inner.companies = companies;
                inner.last_sync = Some(chrono::Utc::now().timestamp());
                inner.error_since = None;
                inner.last_error = None;
                info!(companies = inner.companies.len(), "accounting connection established");
                Ok(ConnectionStatus {
                    status: ConnectionState::Connected,
                    company_name,
                    last_error: None,
                })
            }
            Err(e) => {
                warn!(error = %e, "accounting connect failed");
                inner.mark_error(e.to_string());
                Err(e)
            }
        }
    }

    /// Drop to `disconnected`, clear the company cache, stop the poller.
    pub async fn disconnect(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.state = ConnectionState::Disconnected;
            inner.companies.clear();
            inner.error_since = None;
        }
        if let Some(handle) = self.poller.lock().await.take() {
            handle.abort();
        }
        info!("accounting connection closed");
    }

    /// Cheap status read plus a liveness probe. The only state mutation
    /// allowed here is `connected → error` on probe failure.
    pub async fn test_connection(&self) -> ConnectionStatus {
        let state = self.state().await;
        if state != ConnectionState::Connected {
            let inner = self.inner.lock().await;
            return ConnectionStatus {
                status: state,
                company_name: None,
                last_error: inner.last_error.clone(),
            };
        }

        match self.probe().await {
            Ok(company_name) => {
                let inner = self.inner.lock().await;
                ConnectionStatus {
                    status: ConnectionState::Connected,
                    company_name: company_name.or_else(|| {
                        inner.companies.first().map(|c| c.name.clone())
                    }),
                    last_error: None,
                }
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.mark_error(e.to_string());
                ConnectionStatus {
                    status: ConnectionState::Error,
                    company_name: None,
                    last_error: inner.last_error.clone(),
                }
            }
        }
    }

    /// Cached company list; empty unless connected.
    pub async fn companies(&self) -> Vec<Company> {
        let mut inner = self.inner.lock().await;
        inner.decay(Duration::from_secs(self.config.error_backoff_secs));
        if inner.state == ConnectionState::Connected {
            inner.companies.clone()
        } else {
            Vec::new()
        }
    }

    /// Fetch all ledgers. Requires `connected`; a wire failure moves the
    /// connection to `error`.
    pub async fn ledgers(&self, company: &str) -> Result<Vec<LedgerEntry>, ConnectorError> {
        self.ensure_connected().await?;
        let body = envelope_collection("AllLedgers", "Ledger", LEDGER_FETCH, "", company);
        let xml = self.post_checked(&body).await?;

        let records = collect_records(&xml, "LEDGER");
        let ledgers = records
            .into_iter()
            .filter_map(|fields| {
                let name = first_alias(&fields, LEDGER_NAME_ALIASES)?;
                Some(LedgerEntry {
                    name,
                    parent: first_alias(&fields, PARENT_ALIASES).unwrap_or_default(),
                    opening_balance: parse_wire_amount(
                        &first_alias(&fields, OPENING_ALIASES).unwrap_or_default(),
                    ),
                    closing_balance: parse_wire_amount(
                        &first_alias(&fields, CLOSING_ALIASES).unwrap_or_default(),
                    ),
                })
            })
            .collect();
        Ok(ledgers)
    }

    /// Fetch vouchers, optionally constrained by a date range and type.
    pub async fn vouchers(
        &self,
        company: &str,
        from_date: Option<&str>,
        to_date: Option<&str>,
        voucher_type: Option<&str>,
    ) -> Result<Vec<Voucher>, ConnectorError> {
        self.ensure_connected().await?;

        let date_filter = match (from_date, to_date) {
            (Some(from), Some(to)) => format!(
                "<SVFROMDATE>{}</SVFROMDATE><SVTODATE>{}</SVTODATE>",
                from, to
            ),
            _ => String::new(),
        };
        let body = envelope_collection(
            "VoucherCollection",
            "Voucher",
            VOUCHER_FETCH,
            &date_filter,
            company,
        );
        let xml = self.post_checked(&body).await?;

        let records = collect_records(&xml, "VOUCHER");
        let vouchers: Vec<Voucher> = records
            .into_iter()
            .map(|fields| Voucher {
                date: field(&fields, "DATE"),
                voucher_type: field(&fields, "VOUCHERTYPENAME"),
                voucher_number: field(&fields, "VOUCHERNUMBER"),
                party: field(&fields, "PARTYLEDGERNAME"),
                narration: field(&fields, "NARRATION"),
                amount: parse_wire_amount(&field(&fields, "AMOUNT")),
            })
            .filter(|v| match voucher_type {
                Some(wanted) => v.voucher_type.eq_ignore_ascii_case(wanted),
                None => true,
            })
            .collect();
        Ok(vouchers)
    }

    /// Fetch all stock items.
    pub async fn stock_items(&self, company: &str) -> Result<Vec<StockItem>, ConnectorError> {
        self.ensure_connected().await?;
        let body = envelope_collection("StockItemCollection", "StockItem", STOCK_FETCH, "", company);
        let xml = self.post_checked(&body).await?;

        let records = collect_records(&xml, "STOCKITEM");
        let items = records
            .into_iter()
            .filter_map(|fields| {
                let name = first_alias(&fields, LEDGER_NAME_ALIASES)?;
                Some(StockItem {
                    name,
                    parent: first_alias(&fields, PARENT_ALIASES).unwrap_or_default(),
                    category: field(&fields, "CATEGORY"),
                    opening_balance: parse_wire_amount(
                        &first_alias(&fields, OPENING_ALIASES).unwrap_or_default(),
                    ),
                    closing_balance: parse_wire_amount(
                        &first_alias(&fields, CLOSING_ALIASES).unwrap_or_default(),
                    ),
                })
            })
            .collect();
        Ok(items)
    }

    /// Start the background liveness poller. No-op when polling is
    /// disabled in config or a poller is already running. Request paths
    /// never await this task; they read the cached state.
    pub async fn spawn_poller(self: &Arc<Self>) {
        if self.config.poll_interval_secs == 0 {
            return;
        }
        let mut slot = self.poller.lock().await;
        if slot.is_some() {
            return;
        }

        let connector = Arc::clone(self);
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        *slot = Some(tokio::spawn(async move {
            let mut backoff = interval;
            loop {
                tokio::time::sleep(backoff).await;
                let state = connector.state().await;
                if state != ConnectionState::Connected {
                    // Nothing to watch; keep ticking at base cadence so a
                    // later connect is picked up.
                    backoff = interval;
                    continue;
                }
                match connector.probe().await {
                    Ok(_) => {
                        debug!("accounting poll ok");
                        connector.inner.lock().await.last_sync =
                            Some(chrono::Utc::now().timestamp());
                        backoff = interval;
                    }
                    Err(e) => {
                        warn!(error = %e, "accounting poll failed");
                        connector.inner.lock().await.mark_error(e.to_string());
                        backoff = (backoff * 2).min(Duration::from_secs(POLL_BACKOFF_CAP_SECS));
                    }
                }
            }
        }));
    }

    // ============ wire helpers ============

    async fn ensure_connected(&self) -> Result<(), ConnectorError> {
        if self.state().await != ConnectionState::Connected {
            return Err(ConnectorError::NotConnected);
        }
        Ok(())
    }

    /// Liveness probe: a company-info export. Returns the company name if
    /// one can be read from the response.
    async fn probe(&self) -> Result<Option<String>, ConnectorError> {
        let xml = self.post_raw(ENVELOPE_COMPANY_INFO).await?;
        Ok(first_tag_text(&xml, COMPANY_NAME_ALIASES))
    }

    async fn fetch_companies_raw(&self) -> Result<Vec<Company>, ConnectorError> {
        let xml = self.post_raw(ENVELOPE_COMPANY_LIST).await?;
        let mut companies: Vec<Company> = collect_records(&xml, "COMPANY")
            .into_iter()
            .filter_map(|fields| first_alias(&fields, COMPANY_NAME_ALIASES))
            .map(|name| Company { name })
            .collect();

        // Some servers report companies under REMOTECMPINFO instead.
        if companies.is_empty() {
            companies = collect_records(&xml, "REMOTECMPINFO")
                .into_iter()
                .filter_map(|fields| first_alias(&fields, COMPANY_NAME_ALIASES))
                .map(|name| Company { name })
                .collect();
        }

        if companies.is_empty() {
            return Err(ConnectorError::Protocol(
                "no companies in response".to_string(),
            ));
        }
        Ok(companies)
    }

    /// POST an envelope; a wire failure moves a connected session to
    /// `error`.
    async fn post_checked(&self, body: &str) -> Result<String, ConnectorError> {
        match self.post_raw(body).await {
            Ok(xml) => Ok(xml),
            Err(e) => {
                self.inner.lock().await.mark_error(e.to_string());
                Err(e)
            }
        }
    }

    async fn post_raw(&self, body: &str) -> Result<String, ConnectorError> {
        let response = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "text/xml; charset=utf-8")
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ConnectorError::Timeout(self.config.timeout_secs)
                } else {
                    ConnectorError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectorError::Unreachable(format!("HTTP {}", status)));
        }

        let text = response
            .text()
            .await
            .map_err(|e| ConnectorError::Protocol(e.to_string()))?;
        Ok(clean_xml(&text))
    }
}

// ============ envelopes ============

const ENVELOPE_COMPANY_INFO: &str = r#"<ENVELOPE>
    <HEADER>
        <VERSION>1</VERSION>
        <TALLYREQUEST>Export</TALLYREQUEST>
        <TYPE>Data</TYPE>
        <ID>CompanyInfo</ID>
    </HEADER>
    <BODY>
        <DESC>
            <STATICVARIABLES>
                <SVEXPORTFORMAT>$$SysName:XML</SVEXPORTFORMAT>
            </STATICVARIABLES>
        </DESC>
    </BODY>
</ENVELOPE>"#;

const ENVELOPE_COMPANY_LIST: &str = r#"<ENVELOPE>
    <HEADER>
        <VERSION>1</VERSION>
        <TALLYREQUEST>Export</TALLYREQUEST>
        <TYPE>Collection</TYPE>
        <ID>CompanyList</ID>
    </HEADER>
    <BODY>
        <DESC>
            <STATICVARIABLES>
                <SVEXPORTFORMAT>$$SysName:XML</SVEXPORTFORMAT>
            </STATICVARIABLES>
            <TDL>
                <TDLMESSAGE>
                    <COLLECTION NAME="CompanyList">
                        <TYPE>Company</TYPE>
                        <FETCH>NAME</FETCH>
                    </COLLECTION>
                </TDLMESSAGE>
            </TDL>
        </DESC>
    </BODY>
</ENVELOPE>"#;

const LEDGER_FETCH: &str = "Name, Parent, OpeningBalance, ClosingBalance";
const VOUCHER_FETCH: &str =
    "DATE, VOUCHERTYPENAME, VOUCHERNUMBER, PARTYLEDGERNAME, NARRATION, AMOUNT";
const STOCK_FETCH: &str = "NAME, PARENT, CATEGORY, OPENINGBALANCE, CLOSINGBALANCE";

fn envelope_collection(
    id: &str,
    record_type: &str,
    fetch: &str,
    static_vars: &str,
    company: &str,
) -> String {
    let company_var = if company.is_empty() {
        String::new()
    } else {
        format!("<SVCURRENTCOMPANY>{}</SVCURRENTCOMPANY>", company)
    };
    format!(
        r#"<ENVELOPE>
    <HEADER>
        <VERSION>1</VERSION>
        <TALLYREQUEST>Export</TALLYREQUEST>
        <TYPE>Collection</TYPE>
        <ID>{id}</ID>
    </HEADER>
    <BODY>
        <DESC>
            <STATICVARIABLES>
                <SVEXPORTFORMAT>$$SysName:XML</SVEXPORTFORMAT>
                {company_var}{static_vars}
            </STATICVARIABLES>
            <TDL>
                <TDLMESSAGE>
                    <COLLECTION NAME="{id}">
                        <TYPE>{record_type}</TYPE>
                        <FETCH>{fetch}</FETCH>
                    </COLLECTION>
                </TDLMESSAGE>
            </TDL>
        </DESC>
    </BODY>
</ENVELOPE>"#
    )
}

// ============ lenient XML parsing ============

/// Strip control characters the upstream is known to emit.
fn clean_xml(xml: &str) -> String {
    xml.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\r' || *c == '\t')
        .collect()
}

type Fields = Vec<(String, String)>;

/// Collect every `<record_tag>` element as a flat list of (UPPERCASED
/// leaf tag, text) pairs, preserving document order. Unknown elements are
/// carried through; nothing is required to be present.
fn collect_records(xml: &str, record_tag: &str) -> Vec<Fields> {
    let mut reader = quick_xml::Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);
    reader.config_mut().check_end_names = false;

    let mut records = Vec::new();
    let mut current: Option<Fields> = None;
    let mut leaf: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_uppercase();
                if name == record_tag {
                    current = Some(Vec::new());
                } else if current.is_some() {
                    leaf = Some(name);
                }
            }
            Ok(quick_xml::events::Event::Text(t)) => {
                if let (Some(fields), Some(tag)) = (current.as_mut(), leaf.as_ref()) {
                    let text = t.unescape().unwrap_or_default().trim().to_string();
                    if !text.is_empty() {
                        fields.push((tag.clone(), text));
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_uppercase();
                if name == record_tag {
                    if let Some(fields) = current.take() {
                        records.push(fields);
                    }
                } else if leaf.as_deref() == Some(name.as_str()) {
                    leaf = None;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(_) => break, // lenient: keep whatever parsed cleanly
            _ => {}
        }
        buf.clear();
    }
    records
}

/// First text value among `aliases`, in alias (not document) order.
fn first_alias(fields: &Fields, aliases: &[&str]) -> Option<String> {
    for alias in aliases {
        if let Some((_, value)) = fields.iter().find(|(tag, _)| tag == alias) {
            return Some(value.clone());
        }
    }
    None
}

fn field(fields: &Fields, tag: &str) -> String {
    fields
        .iter()
        .find(|(t, _)| t == tag)
        .map(|(_, v)| v.clone())
        .unwrap_or_default()
}

/// First text found for any of `tags` anywhere in the document, in tag
/// priority order.
fn first_tag_text(xml: &str, tags: &[&str]) -> Option<String> {
    let mut reader = quick_xml::Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);
    reader.config_mut().check_end_names = false;

    let mut found: Vec<(usize, String)> = Vec::new();
    let mut active: Option<usize> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_uppercase();
                active = tags.iter().position(|t| *t == name);
            }
            Ok(quick_xml::events::Event::Text(t)) => {
                if let Some(priority) = active {
                    let text = t.unescape().unwrap_or_default().trim().to_string();
                    if text.len() > 2 {
                        found.push((priority, text));
                    }
                }
            }
            Ok(quick_xml::events::Event::End(_)) => active = None,
            Ok(quick_xml::events::Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    found.sort_by_key(|(priority, _)| *priority);
    found.into_iter().next().map(|(_, text)| text)
}

/// Parse an upstream amount string (`"1,50,000.00"`, `"-500"`). Follows
/// the upstream convention of treating unparseable values as zero.
pub fn parse_wire_amount(raw: &str) -> f64 {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    cleaned.parse::<f64>().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(port: u16) -> AccountingConfig {
        AccountingConfig {
            host: "127.0.0.1".to_string(),
            port,
            timeout_secs: 2,
            error_backoff_secs: 0,
            poll_interval_secs: 0,
        }
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let connector = AccountingConnector::new(test_config(1));
        assert_eq!(connector.state().await, ConnectionState::Disconnected);
        assert!(connector.companies().await.is_empty());
    }

    #[tokio::test]
    async fn failed_connect_moves_to_error_then_decays() {
        // Port 1 refuses immediately.
        let connector = AccountingConnector::new(AccountingConfig {
            error_backoff_secs: 3600,
            ..test_config(1)
        });
        assert!(connector.connect().await.is_err());

        let inner_state = connector.inner.lock().await.state;
        assert_eq!(inner_state, ConnectionState::Error);

        // With a zero backoff the same failure decays immediately.
        let connector = AccountingConnector::new(test_config(1));
        assert!(connector.connect().await.is_err());
        assert_eq!(connector.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn fetches_require_connection() {
        let connector = AccountingConnector::new(test_config(1));
        assert!(matches!(
            connector.ledgers("Acme Co").await,
            Err(ConnectorError::NotConnected)
        ));
        assert!(matches!(
            connector.vouchers("Acme Co", None, None, None).await,
            Err(ConnectorError::NotConnected)
        ));
        assert!(matches!(
            connector.stock_items("Acme Co").await,
            Err(ConnectorError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connection_reports_without_connecting() {
        let connector = AccountingConnector::new(test_config(1));
        let status = connector.test_connection().await;
        assert_eq!(status.status, ConnectionState::Disconnected);
        assert!(status.company_name.is_none());
        // A status read never initiates a connection.
        assert_eq!(connector.state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn collect_records_reads_ledger_fields() {
        let xml = r#"<ENVELOPE><BODY><DATA>
            <LEDGER><NAME>Sales Account</NAME><PARENT>Sales Accounts</PARENT>
                <OPENINGBALANCE>0</OPENINGBALANCE><CLOSINGBALANCE>1,50,000.00</CLOSINGBALANCE></LEDGER>
            <LEDGER><LEDGERNAME>Rent</LEDGERNAME><GROUPNAME>Indirect Expenses</GROUPNAME>
                <CLOSINGVALUE>-20000</CLOSINGVALUE></LEDGER>
        </DATA></BODY></ENVELOPE>"#;

        let records = collect_records(xml, "LEDGER");
        assert_eq!(records.len(), 2);

        // Canonical alias resolution: primary names first.
        assert_eq!(
            first_alias(&records[0], LEDGER_NAME_ALIASES).unwrap(),
            "Sales Account"
        );
        assert_eq!(
            parse_wire_amount(&first_alias(&records[0], CLOSING_ALIASES).unwrap()),
            150000.0
        );

        // Variant field names resolve through the same tables.
        assert_eq!(first_alias(&records[1], LEDGER_NAME_ALIASES).unwrap(), "Rent");
        assert_eq!(
            first_alias(&records[1], PARENT_ALIASES).unwrap(),
            "Indirect Expenses"
        );
        assert_eq!(
            parse_wire_amount(&first_alias(&records[1], CLOSING_ALIASES).unwrap()),
            -20000.0
        );
    }

    #[test]
    fn alias_order_wins_over_document_order() {
        let xml = r#"<L><DSPDISPNAME>Display</DSPDISPNAME><NAME>Canonical</NAME></L>"#;
        let records = collect_records(xml, "L");
        assert_eq!(
            first_alias(&records[0], LEDGER_NAME_ALIASES).unwrap(),
            "Canonical",
            "NAME outranks DSPDISPNAME regardless of position"
        );
    }

    #[test]
    fn first_tag_text_respects_priority() {
        let xml = "<R><NAME>Fallback Co</NAME><COMPANYNAME>Primary Co</COMPANYNAME></R>";
        assert_eq!(
            first_tag_text(xml, COMPANY_NAME_ALIASES).unwrap(),
            "Primary Co"
        );
    }

    #[test]
    fn clean_xml_strips_control_chars() {
        let dirty = "<A>\u{0}\u{8}text\u{b}</A>";
        assert_eq!(clean_xml(dirty), "<A>text</A>");
    }

    #[test]
    fn parse_wire_amount_variants() {
        assert_eq!(parse_wire_amount("1,50,000.00"), 150000.0);
        assert_eq!(parse_wire_amount("-500"), -500.0);
        assert_eq!(parse_wire_amount(""), 0.0);
        assert_eq!(parse_wire_amount("garbage"), 0.0);
    }

    #[tokio::test]
    async fn concurrent_connects_collapse() {
        let connector = Arc::new(AccountingConnector::new(test_config(1)));
        let a = Arc::clone(&connector);
        let b = Arc::clone(&connector);
        let (ra, rb) = tokio::join!(a.connect(), b.connect());
        // Both observe the one failed attempt; no panic, no deadlock.
        assert!(ra.is_err() && rb.is_err());
    }
}
