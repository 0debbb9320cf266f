//! Cluster and store-definition XML mapping.
//!
//! The on-disk topology formats are small and fixed, so serialization is
//! direct string assembly (stable output, round-trip tested) and parsing
//! uses a pull reader. Parse-then-serialize is byte-stable modulo
//! whitespace.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::cluster::{Cluster, Node};
use crate::error::{Result, StoreError};
use crate::store::{RoutingTier, StoreDefinition, StoreType};

pub fn write_cluster(cluster: &Cluster) -> String {
    let mut out = String::new();
    out.push_str("<cluster>\n");
    out.push_str(&format!("  <name>{}</name>\n", escape(cluster.name())));
    for node in cluster.nodes() {
        out.push_str("  <server>\n");
        out.push_str(&format!("    <id>{}</id>\n", node.id));
        out.push_str(&format!("    <host>{}</host>\n", escape(&node.host)));
        out.push_str(&format!("    <http-port>{}</http-port>\n", node.http_port));
        out.push_str(&format!(
            "    <socket-port>{}</socket-port>\n",
            node.socket_port
        ));
        out.push_str(&format!(
            "    <admin-port>{}</admin-port>\n",
            node.admin_port
        ));
        let partitions: Vec<String> = node.partitions.iter().map(u16::to_string).collect();
        out.push_str(&format!(
            "    <partitions>{}</partitions>\n",
            partitions.join(", ")
        ));
        out.push_str("  </server>\n");
    }
    out.push_str("</cluster>\n");
    out
}

pub fn parse_cluster(text: &str) -> Result<Cluster> {
    let mut reader = reader(text);
    let mut name: Option<String> = None;
    let mut nodes: Vec<Node> = Vec::new();
    let mut server: Option<ServerFields> = None;
    let mut field: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => match start.name().as_ref() {
                b"cluster" => {}
                b"server" => server = Some(ServerFields::default()),
                other => field = Some(String::from_utf8_lossy(other).into_owned()),
            },
            Ok(Event::Text(t)) => {
                let value = t
                    .unescape()
                    .map_err(|e| bad_xml("cluster", e))?
                    .into_owned();
                let Some(field) = field.as_deref() else {
                    continue;
                };
                match &mut server {
                    None => {
                        if field == "name" {
                            name = Some(value);
                        }
                    }
                    Some(fields) => fields.set(field, &value)?,
                }
            }
            Ok(Event::End(end)) => match end.name().as_ref() {
                b"server" => {
                    let fields = server.take().ok_or_else(|| {
                        StoreError::InvalidRequest("</server> without <server>".into())
                    })?;
                    nodes.push(fields.build()?);
                }
                _ => field = None,
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(bad_xml("cluster", e)),
        }
    }

    let name = name.ok_or_else(|| StoreError::InvalidRequest("cluster has no <name>".into()))?;
    Cluster::new(name, nodes)
}

pub fn write_stores(defs: &[StoreDefinition]) -> String {
    let mut out = String::new();
    out.push_str("<stores>\n");
    for def in defs {
        out.push_str("  <store>\n");
        out.push_str(&format!("    <name>{}</name>\n", escape(&def.name)));
        out.push_str(&format!(
            "    <persistence>{}</persistence>\n",
            def.store_type.as_str()
        ));
        out.push_str(&format!(
            "    <routing>{}</routing>\n",
            def.routing.as_str()
        ));
        out.push_str(&format!(
            "    <replication-factor>{}</replication-factor>\n",
            def.replication_factor
        ));
        out.push_str(&format!(
            "    <required-reads>{}</required-reads>\n",
            def.required_reads
        ));
        out.push_str(&format!(
            "    <preferred-reads>{}</preferred-reads>\n",
            def.preferred_reads
        ));
        out.push_str(&format!(
            "    <required-writes>{}</required-writes>\n",
            def.required_writes
        ));
        out.push_str(&format!(
            "    <preferred-writes>{}</preferred-writes>\n",
            def.preferred_writes
        ));
        out.push_str(&format!(
            "    <key-serializer>{}</key-serializer>\n",
            escape(&def.key_serializer)
        ));
        out.push_str(&format!(
            "    <value-serializer>{}</value-serializer>\n",
            escape(&def.value_serializer)
        ));
        out.push_str("  </store>\n");
    }
    out.push_str("</stores>\n");
    out
}

pub fn parse_stores(text: &str) -> Result<Vec<StoreDefinition>> {
    let mut reader = reader(text);
    let mut defs: Vec<StoreDefinition> = Vec::new();
    let mut store: Option<StoreFields> = None;
    let mut field: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => match start.name().as_ref() {
                b"stores" => {}
                b"store" => store = Some(StoreFields::default()),
                other => field = Some(String::from_utf8_lossy(other).into_owned()),
            },
            Ok(Event::Text(t)) => {
                let value = t.unescape().map_err(|e| bad_xml("stores", e))?.into_owned();
                if let (Some(fields), Some(field)) = (&mut store, field.as_deref()) {
                    fields.set(field, &value)?;
                }
            }
            Ok(Event::End(end)) => match end.name().as_ref() {
                b"store" => {
                    let fields = store.take().ok_or_else(|| {
                        StoreError::InvalidRequest("</store> without <store>".into())
                    })?;
                    defs.push(fields.build()?);
                }
                _ => field = None,
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(bad_xml("stores", e)),
        }
    }

    for def in &defs {
        def.validate()?;
    }
    Ok(defs)
}

fn reader(text: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);
    reader
}

fn bad_xml(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::InvalidRequest(format!("malformed {what} xml: {err}"))
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[derive(Default)]
struct ServerFields {
    id: Option<u16>,
    host: Option<String>,
    http_port: Option<u16>,
    socket_port: Option<u16>,
    admin_port: Option<u16>,
    partitions: Option<Vec<u16>>,
}

impl ServerFields {
    fn set(&mut self, field: &str, value: &str) -> Result<()> {
        match field {
            "id" => self.id = Some(parse_num(field, value)?),
            "host" => self.host = Some(value.to_string()),
            "http-port" => self.http_port = Some(parse_num(field, value)?),
            "socket-port" => self.socket_port = Some(parse_num(field, value)?),
            "admin-port" => self.admin_port = Some(parse_num(field, value)?),
            "partitions" => {
                let mut partitions = Vec::new();
                for piece in value.split(',') {
                    let piece = piece.trim();
                    if !piece.is_empty() {
                        partitions.push(parse_num(field, piece)?);
                    }
                }
                self.partitions = Some(partitions);
            }
            _ => {}
        }
        Ok(())
    }

    fn build(self) -> Result<Node> {
        Ok(Node::new(
            require(self.id, "server", "id")?,
            require(self.host, "server", "host")?,
            require(self.http_port, "server", "http-port")?,
            require(self.socket_port, "server", "socket-port")?,
            require(self.admin_port, "server", "admin-port")?,
            self.partitions.unwrap_or_default(),
        ))
    }
}

#[derive(Default)]
struct StoreFields {
    name: Option<String>,
    persistence: Option<StoreType>,
    routing: Option<RoutingTier>,
    replication_factor: Option<u8>,
    required_reads: Option<u8>,
    preferred_reads: Option<u8>,
    required_writes: Option<u8>,
    preferred_writes: Option<u8>,
    key_serializer: Option<String>,
    value_serializer: Option<String>,
}

impl StoreFields {
    fn set(&mut self, field: &str, value: &str) -> Result<()> {
        match field {
            "name" => self.name = Some(value.to_string()),
            "persistence" => self.persistence = Some(StoreType::parse(value)?),
            "routing" => self.routing = Some(RoutingTier::parse(value)?),
            "replication-factor" => self.replication_factor = Some(parse_num(field, value)?),
            "required-reads" => self.required_reads = Some(parse_num(field, value)?),
            "preferred-reads" => self.preferred_reads = Some(parse_num(field, value)?),
            "required-writes" => self.required_writes = Some(parse_num(field, value)?),
            "preferred-writes" => self.preferred_writes = Some(parse_num(field, value)?),
            "key-serializer" => self.key_serializer = Some(value.to_string()),
            "value-serializer" => self.value_serializer = Some(value.to_string()),
            _ => {}
        }
        Ok(())
    }

    fn build(self) -> Result<StoreDefinition> {
        Ok(StoreDefinition {
            name: require(self.name, "store", "name")?,
            store_type: require(self.persistence, "store", "persistence")?,
            routing: require(self.routing, "store", "routing")?,
            replication_factor: require(self.replication_factor, "store", "replication-factor")?,
            required_reads: require(self.required_reads, "store", "required-reads")?,
            preferred_reads: require(self.preferred_reads, "store", "preferred-reads")?,
            required_writes: require(self.required_writes, "store", "required-writes")?,
            preferred_writes: require(self.preferred_writes, "store", "preferred-writes")?,
            key_serializer: require(self.key_serializer, "store", "key-serializer")?,
            value_serializer: require(self.value_serializer, "store", "value-serializer")?,
        })
    }
}

fn parse_num<T: std::str::FromStr>(field: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| StoreError::InvalidRequest(format!("bad numeric value `{value}` in <{field}>")))
}

fn require<T>(value: Option<T>, parent: &str, field: &str) -> Result<T> {
    value.ok_or_else(|| {
        StoreError::InvalidRequest(format!("missing <{field}> in <{parent}> element"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cluster() -> Cluster {
        Cluster::new(
            "sample",
            vec![
                Node::new(0, "localhost", 8081, 6666, 7777, vec![0, 1]),
                Node::new(1, "10.0.0.2", 8082, 6667, 7778, vec![2, 3]),
            ],
        )
        .unwrap()
    }

    fn sample_stores() -> Vec<StoreDefinition> {
        vec![StoreDefinition {
            name: "users".into(),
            store_type: StoreType::Memory,
            routing: RoutingTier::Server,
            replication_factor: 2,
            required_reads: 1,
            preferred_reads: 2,
            required_writes: 1,
            preferred_writes: 2,
            key_serializer: "string".into(),
            value_serializer: "string".into(),
        }]
    }

    #[test]
    fn cluster_roundtrip_is_stable() {
        let cluster = sample_cluster();
        let first = write_cluster(&cluster);
        let parsed = parse_cluster(&first).unwrap();
        assert_eq!(parsed, cluster);
        assert_eq!(write_cluster(&parsed), first);
    }

    #[test]
    fn cluster_parse_ignores_surrounding_whitespace() {
        let loose = "<cluster><name>sample</name><server><id>0</id>\
                     <host>localhost</host><http-port>8081</http-port>\
                     <socket-port>6666</socket-port><admin-port>7777</admin-port>\
                     <partitions> 0 , 1 </partitions></server></cluster>";
        let parsed = parse_cluster(loose).unwrap();
        assert_eq!(parsed.node(0).unwrap().partitions, vec![0, 1]);
    }

    #[test]
    fn stores_roundtrip_is_stable() {
        let defs = sample_stores();
        let first = write_stores(&defs);
        let parsed = parse_stores(&first).unwrap();
        assert_eq!(parsed, defs);
        assert_eq!(write_stores(&parsed), first);
    }

    #[test]
    fn missing_fields_are_rejected() {
        let err = parse_cluster("<cluster><name>x</name><server><id>0</id></server></cluster>")
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }

    #[test]
    fn invalid_quorums_are_rejected_at_parse() {
        let mut defs = sample_stores();
        defs[0].required_reads = 3;
        let xml = write_stores(&defs);
        assert!(parse_stores(&xml).is_err());
    }

    #[test]
    fn hostile_text_is_escaped() {
        let cluster = Cluster::new(
            "a<b&c",
            vec![Node::new(0, "localhost", 1, 2, 3, vec![0])],
        )
        .unwrap();
        let xml = write_cluster(&cluster);
        let parsed = parse_cluster(&xml).unwrap();
        assert_eq!(parsed.name(), "a<b&c");
    }
}
