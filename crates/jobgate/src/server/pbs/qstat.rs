use roxmltree::{Document, Node, ParsingOptions};

use crate::common::error::GatewayError;
use crate::server::job::PbsStatus;

/// One `Job` element of `qstat -x` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QstatJob {
    pub id: String,
    pub status: PbsStatus,
    /// Host part of `exec_host`, empty when the job has not started.
    pub worker_node: String,
    pub comment: String,
    pub batch_filename: String,
}

pub(super) fn parse_xml(xml: &str) -> crate::Result<Document<'_>> {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    Document::parse_with_options(xml, options)
        .map_err(|error| GatewayError::InternalError(format!("Cannot parse XML: {error}")))
}

pub(super) fn child_text(node: Node, name: &str) -> Option<String> {
    node.children()
        .find(|child| child.has_tag_name(name))
        .map(|child| child.text().unwrap_or_default().trim().to_string())
}

/// Parses `qstat -x` output. Empty output means that no jobs are known.
pub fn parse_qstat(xml: &str) -> crate::Result<Vec<QstatJob>> {
    let xml = xml.trim();
    if xml.is_empty() {
        return Ok(vec![]);
    }
    let document = parse_xml(xml)?;
    let mut jobs = Vec::new();
    for node in document
        .root_element()
        .children()
        .filter(|n| n.has_tag_name("Job"))
    {
        let Some(id) = child_text(node, "Job_Id") else {
            return Err(GatewayError::InternalError(
                "qstat reported a job without Job_Id".to_string(),
            ));
        };
        let status = child_text(node, "job_state").unwrap_or_default();
        let worker_node = child_text(node, "exec_host")
            .and_then(|host| host.split('/').next().map(|s| s.to_string()))
            .unwrap_or_default();
        jobs.push(QstatJob {
            id,
            status: PbsStatus::from_code(&status),
            worker_node,
            comment: child_text(node, "comment").unwrap_or_default(),
            batch_filename: child_text(node, "Job_Name").unwrap_or_default(),
        });
    }
    Ok(jobs)
}
