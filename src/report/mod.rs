//! Report summarization.
//!
//! The engine's report stays an opaque blob in the store; this module only
//! derives the fixed summary counts from it. Parsing is best-effort: a
//! malformed blob yields zeros for whatever could not be read and never an
//! error, so a `Done` scan stays `Done`.

use std::collections::HashSet;

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::models::scan::ScanSummary;

/// Extract the summary from a report blob: distinct hosts plus result
/// counts by threat bucket (`High`, `Medium`, `Low`, `Log`).
pub fn summarize(report_xml: &str) -> ScanSummary {
    let mut summary = ScanSummary::default();
    let mut hosts: HashSet<String> = HashSet::new();

    let mut reader = Reader::from_str(report_xml);
    let mut stack: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                stack.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                let Ok(text) = t.unescape() else { continue };
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }

                match stack.as_slice() {
                    [.., parent, leaf] if leaf == "host" && parent == "result" => {
                        hosts.insert(text.to_string());
                    }
                    // Host detail sections list addresses as <host><ip>.
                    [.., parent, leaf] if leaf == "ip" && parent == "host" => {
                        hosts.insert(text.to_string());
                    }
                    [.., parent, leaf] if leaf == "threat" && parent == "result" => {
                        match text {
                            "High" => summary.vulns_high += 1,
                            "Medium" => summary.vulns_medium += 1,
                            "Low" => summary.vulns_low += 1,
                            "Log" => summary.vulns_log += 1,
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            // Best-effort: keep whatever was counted before the blob broke.
            Err(_) => break,
            _ => {}
        }
    }

    summary.hosts_scanned = hosts.len() as i64;
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"
        <get_reports_response status="200" status_text="OK">
          <report id="r-1">
            <report>
              <results>
                <result id="1">
                  <host>192.168.15.20</host>
                  <threat>High</threat>
                </result>
                <result id="2">
                  <host>192.168.15.20</host>
                  <threat>High</threat>
                </result>
                <result id="3">
                  <host>192.168.15.21</host>
                  <threat>Medium</threat>
                </result>
                <result id="4">
                  <host>192.168.15.21</host>
                  <threat>Low</threat>
                </result>
                <result id="5">
                  <host>192.168.15.21</host>
                  <threat>Log</threat>
                </result>
              </results>
              <host>
                <ip>192.168.15.20</ip>
              </host>
              <host>
                <ip>192.168.15.21</ip>
              </host>
            </report>
          </report>
        </get_reports_response>"#;

    #[test]
    fn counts_threat_buckets_and_distinct_hosts() {
        let summary = summarize(REPORT);
        assert_eq!(summary.hosts_scanned, 2);
        assert_eq!(summary.vulns_high, 2);
        assert_eq!(summary.vulns_medium, 1);
        assert_eq!(summary.vulns_low, 1);
        assert_eq!(summary.vulns_log, 1);
    }

    #[test]
    fn unknown_threats_are_ignored() {
        let xml = r#"
            <report><results>
              <result><host>10.0.0.1</host><threat>Debug</threat></result>
              <result><host>10.0.0.1</host><threat>High</threat></result>
            </results></report>"#;
        let summary = summarize(xml);
        assert_eq!(summary.vulns_high, 1);
        assert_eq!(summary.hosts_scanned, 1);
        assert_eq!(summary.vulns_medium, 0);
    }

    #[test]
    fn malformed_report_yields_zeros() {
        assert_eq!(summarize(""), ScanSummary::default());
        assert_eq!(summarize("not xml at all <<<"), ScanSummary::default());
    }

    #[test]
    fn truncated_report_keeps_partial_counts() {
        let xml = r#"<report><results><result><host>10.0.0.9</host><threat>High</threat></result><result><host>"#;
        let summary = summarize(xml);
        assert_eq!(summary.vulns_high, 1);
        assert_eq!(summary.hosts_scanned, 1);
    }
}
