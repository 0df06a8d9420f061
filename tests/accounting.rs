//! Accounting connector and aggregator scenarios against a canned
//! XML-over-HTTP server: connect, fetch live metrics, lose the endpoint,
//! degrade to demo data.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use finsight::aggregator::AccountingAggregator;
use finsight::config::AccountingConfig;
use finsight::connector::{AccountingConnector, ConnectionState};
use finsight::models::DataSource;

const COMPANY_LIST_XML: &str = r#"<ENVELOPE><BODY><DATA>
<COLLECTION>
<COMPANY><NAME>Acme Co</NAME></COMPANY>
<COMPANY><NAME>Globex Ltd</NAME></COMPANY>
</COLLECTION>
</DATA></BODY></ENVELOPE>"#;

const COMPANY_INFO_XML: &str = r#"<ENVELOPE><BODY><DATA>
<COMPANYNAME>Acme Co</COMPANYNAME>
</DATA></BODY></ENVELOPE>"#;

const LEDGERS_XML: &str = r#"<ENVELOPE><BODY><DATA>
<COLLECTION>
<LEDGER><NAME>Product Sales</NAME><PARENT>Sales Accounts</PARENT>
  <OPENINGBALANCE>0</OPENINGBALANCE><CLOSINGBALANCE>1,00,000.00</CLOSINGBALANCE></LEDGER>
<LEDGER><NAME>Service Income</NAME><PARENT>Direct Income</PARENT>
  <CLOSINGBALANCE>50000</CLOSINGBALANCE></LEDGER>
<LEDGER><LEDGERNAME>Office Rent</LEDGERNAME><GROUPNAME>Indirect Expenses</GROUPNAME>
  <CLOSINGVALUE>-40000</CLOSINGVALUE></LEDGER>
<LEDGER><NAME>Warehouse</NAME><PARENT>Fixed Assets</PARENT>
  <CLOSINGBALANCE>200000</CLOSINGBALANCE></LEDGER>
<LEDGER><NAME>Bank Loan</NAME><PARENT>Loans (Liability)</PARENT>
  <CLOSINGBALANCE>80000</CLOSINGBALANCE></LEDGER>
</COLLECTION>
</DATA></BODY></ENVELOPE>"#;

const VOUCHERS_XML: &str = r#"<ENVELOPE><BODY><DATA>
<COLLECTION>
<VOUCHER><DATE>20250405</DATE><VOUCHERTYPENAME>Sales</VOUCHERTYPENAME>
  <VOUCHERNUMBER>17</VOUCHERNUMBER><PARTYLEDGERNAME>Globex Ltd</PARTYLEDGERNAME>
  <NARRATION>April order</NARRATION><AMOUNT>12,500.00</AMOUNT></VOUCHER>
<VOUCHER><DATE>20250409</DATE><VOUCHERTYPENAME>Payment</VOUCHERTYPENAME>
  <VOUCHERNUMBER>18</VOUCHERNUMBER><PARTYLEDGERNAME>Initech</PARTYLEDGERNAME>
  <NARRATION>Rent</NARRATION><AMOUNT>-4000</AMOUNT></VOUCHER>
</COLLECTION>
</DATA></BODY></ENVELOPE>"#;

/// Minimal HTTP/1.1 responder that routes on the request body's envelope
/// ID and answers with canned XML.
async fn spawn_mock_accounting() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                // Read until the headers are in and the declared body has
                // arrived (best effort; requests here are small).
                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    request.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&request);
                    if let Some(header_end) = text.find("\r\n\r\n") {
                        let content_length = text
                            .lines()
                            .find_map(|line| {
                                line.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                            })
                            .unwrap_or(0);
                        if request.len() >= header_end + 4 + content_length {
                            break;
                        }
                    }
                }

                let text = String::from_utf8_lossy(&request);
                let body = if text.contains("CompanyList") {
                    COMPANY_LIST_XML
                } else if text.contains("AllLedgers") {
                    LEDGERS_XML
                } else if text.contains("VoucherCollection") {
                    VOUCHERS_XML
                } else {
                    COMPANY_INFO_XML
                };

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/xml; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, handle)
}

fn config_for(addr: SocketAddr) -> AccountingConfig {
    AccountingConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        timeout_secs: 5,
        error_backoff_secs: 3600,
        poll_interval_secs: 0,
    }
}

#[tokio::test]
async fn connect_enumerates_and_caches_companies() {
    let (addr, server) = spawn_mock_accounting().await;
    let connector = AccountingConnector::new(config_for(addr));

    let status = connector.connect().await.unwrap();
    assert_eq!(status.status, ConnectionState::Connected);
    assert_eq!(status.company_name.as_deref(), Some("Acme Co"));

    let companies = connector.companies().await;
    assert_eq!(companies.len(), 2);
    assert_eq!(companies[0].name, "Acme Co");
    assert_eq!(companies[1].name, "Globex Ltd");

    // Cache survives the server going away until something probes.
    server.abort();
    let cached = connector.companies().await;
    assert_eq!(cached.len(), 2);
}

#[tokio::test]
async fn ledgers_normalize_variant_field_names() {
    let (addr, _server) = spawn_mock_accounting().await;
    let connector = AccountingConnector::new(config_for(addr));
    connector.connect().await.unwrap();

    let ledgers = connector.ledgers("Acme Co").await.unwrap();
    assert_eq!(ledgers.len(), 5);

    let rent = ledgers.iter().find(|l| l.name == "Office Rent").unwrap();
    assert_eq!(rent.parent, "Indirect Expenses");
    assert_eq!(rent.closing_balance, -40000.0);

    let sales = ledgers.iter().find(|l| l.name == "Product Sales").unwrap();
    assert_eq!(sales.closing_balance, 100000.0);
}

#[tokio::test]
async fn vouchers_parse_and_filter_by_type() {
    let (addr, _server) = spawn_mock_accounting().await;
    let connector = AccountingConnector::new(config_for(addr));
    connector.connect().await.unwrap();

    let all = connector
        .vouchers("Acme Co", Some("20250401"), Some("20250430"), None)
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].amount, 12500.0);

    let sales_only = connector
        .vouchers("Acme Co", None, None, Some("sales"))
        .await
        .unwrap();
    assert_eq!(sales_only.len(), 1);
    assert_eq!(sales_only[0].party, "Globex Ltd");
}

#[tokio::test]
async fn scenario_c_live_metrics_then_demo_after_disconnect() {
    let (addr, _server) = spawn_mock_accounting().await;
    let config = config_for(addr);
    let connector = Arc::new(AccountingConnector::new(config.clone()));
    let aggregator = AccountingAggregator::new(Arc::clone(&connector), &config);

    connector.connect().await.unwrap();

    let live = aggregator.financial_metrics("Acme Co", None, None).await;
    assert_eq!(live.data_source, DataSource::Live);
    assert_eq!(live.revenue, 150000.0); // 1,00,000 sales + 50,000 income
    assert_eq!(live.expenses, 40000.0);
    assert_eq!(live.profit, 110000.0);
    assert_eq!(live.net_worth, 120000.0); // 200,000 assets - 80,000 loan

    connector.disconnect().await;

    let demo = aggregator.financial_metrics("Acme Co", None, None).await;
    assert_eq!(demo.data_source, DataSource::Demo);
    assert_eq!(demo.profit, demo.revenue - demo.expenses);
}

#[tokio::test]
async fn endpoint_loss_after_connect_degrades_to_demo() {
    let (addr, server) = spawn_mock_accounting().await;
    let config = config_for(addr);
    let connector = Arc::new(AccountingConnector::new(config.clone()));
    let aggregator = AccountingAggregator::new(Arc::clone(&connector), &config);

    connector.connect().await.unwrap();
    assert_eq!(connector.state().await, ConnectionState::Connected);

    // Endpoint becomes unreachable.
    server.abort();
    // Give the listener a moment to die.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // The next metrics call must degrade, not raise.
    let snapshot = aggregator.financial_metrics("Acme Co", None, None).await;
    assert_eq!(snapshot.data_source, DataSource::Demo);
    assert_ne!(connector.state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn probe_failure_moves_connected_to_error() {
    let (addr, server) = spawn_mock_accounting().await;
    let connector = AccountingConnector::new(config_for(addr));
    connector.connect().await.unwrap();

    server.abort();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let status = connector.test_connection().await;
    assert_eq!(status.status, ConnectionState::Error);
    assert!(status.last_error.is_some());
}
