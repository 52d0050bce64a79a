use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::common::error::GatewayError;
use crate::server::pbs::qstat::parse_xml;

/// Host to one-minute load average.
pub type HostLoads = HashMap<String, f32>;

pub trait LoadSource: Send + Sync {
    fn loads(&self) -> BoxFuture<'_, crate::Result<HostLoads>>;
}

pub type LoadSourceRef = Arc<dyn LoadSource>;

/// Reads `load_one` metrics from the XML dump served by a Ganglia `gmond`.
pub struct GangliaLoadSource {
    host: String,
    port: u16,
}

impl GangliaLoadSource {
    /// Creates the source after checking that the feed accepts connections.
    pub async fn connect(host: &str, port: u16) -> crate::Result<Self> {
        let source = Self {
            host: host.to_string(),
            port,
        };
        source.open().await?;
        Ok(source)
    }

    async fn open(&self) -> crate::Result<TcpStream> {
        TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|error| {
                GatewayError::InternalError(format!(
                    "Cannot connect to Ganglia at {}:{}: {error}",
                    self.host, self.port
                ))
            })
    }

    async fn fetch(&self) -> crate::Result<HostLoads> {
        let mut stream = self.open().await?;
        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer).await?;
        drop(stream);
        parse_ganglia(&String::from_utf8_lossy(&buffer))
    }
}

impl LoadSource for GangliaLoadSource {
    fn loads(&self) -> BoxFuture<'_, crate::Result<HostLoads>> {
        Box::pin(self.fetch())
    }
}

pub fn parse_ganglia(xml: &str) -> crate::Result<HostLoads> {
    let document = parse_xml(xml.trim())?;
    let mut loads = HostLoads::new();
    for host in document.descendants().filter(|n| n.has_tag_name("HOST")) {
        let Some(name) = host.attribute("NAME") else {
            continue;
        };
        let metric = host
            .children()
            .find(|m| m.has_tag_name("METRIC") && m.attribute("NAME") == Some("load_one"));
        if let Some(value) = metric.and_then(|m| m.attribute("VAL")) {
            let load = value.trim().parse::<f32>().map_err(|_| {
                GatewayError::InternalError(format!("Invalid load {value:?} reported for {name}"))
            })?;
            loads.insert(name.to_string(), load);
        }
    }
    Ok(loads)
}
