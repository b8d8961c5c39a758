//! Cluster topology.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::Path;

use log;
use serde::Deserialize;

/// Upper bound on cluster size: destinations are taken from the bits of a single key byte.
pub const MAX_CLUSTER_SIZE: usize = 256;

/// Node identifier, dense in `0..cluster_size`.
pub type NodeId = usize;

/// Cluster configuration error. Always fatal and raised before any network activity.
#[derive(Debug)]
pub enum ClusterError {
    /// Configuration file could not be read.
    IO(io::Error),
    /// Configuration document could not be parsed.
    Parse(serde_yaml::Error),
    /// Cluster size is zero, not a power of two or exceeds [`MAX_CLUSTER_SIZE`].
    InvalidSize(usize),
    /// Node id appears more than once.
    DuplicateNode(NodeId),
    /// Node ids are not dense: the id is absent from the configuration.
    MissingNode(NodeId),
    /// Node id is not part of the cluster.
    UnknownNode(NodeId),
    /// Port value is not a valid TCP port.
    InvalidPort { node: NodeId, port: String },
}

impl Error for ClusterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            ClusterError::IO(err) => Some(err),
            ClusterError::Parse(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ClusterError::IO(err) => write!(f, "cluster config not readable: {}", err),
            ClusterError::Parse(err) => write!(f, "cluster config not parsable: {}", err),
            ClusterError::InvalidSize(size) => write!(
                f,
                "invalid cluster size {}: must be a power of two between 1 and {}",
                size, MAX_CLUSTER_SIZE
            ),
            ClusterError::DuplicateNode(id) => write!(f, "node {} is configured more than once", id),
            ClusterError::MissingNode(id) => write!(f, "node {} is missing, node ids must be dense", id),
            ClusterError::UnknownNode(id) => write!(f, "node {} is not part of the cluster", id),
            ClusterError::InvalidPort { node, port } => write!(f, "node {} has an invalid port {:?}", node, port),
        }
    }
}

/// Cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

impl Node {
    pub fn new(id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Node {
            id,
            host: host.into(),
            port,
        }
    }

    /// Address in `host:port` form, suitable for dialing and binding.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Deserialize)]
struct ServerConfigs {
    servers: Vec<ServerConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerConfig {
    server_id: NodeId,
    host: String,
    port: serde_yaml::Value,
}

/// Ordered, validated set of nodes, fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    nodes: Vec<Node>,
}

impl Cluster {
    /// Builds a cluster from a node list, checking size and id density.
    pub fn from_nodes(mut nodes: Vec<Node>) -> Result<Self, ClusterError> {
        validate_size(nodes.len())?;

        nodes.sort_by_key(|node| node.id);
        for (expected, node) in nodes.iter().enumerate() {
            if node.id != expected {
                return Err(if expected > 0 && nodes[expected - 1].id == node.id {
                    ClusterError::DuplicateNode(node.id)
                } else {
                    ClusterError::MissingNode(expected)
                });
            }
        }

        return Ok(Cluster { nodes });
    }

    /// Parses a YAML document of the form `servers: [{serverId, host, port}]`.
    pub fn from_yaml(document: &str) -> Result<Self, ClusterError> {
        let configs: ServerConfigs = serde_yaml::from_str(document).map_err(ClusterError::Parse)?;

        let nodes = configs
            .servers
            .into_iter()
            .map(|server| {
                let port = match &server.port {
                    serde_yaml::Value::String(port) => port.trim().parse::<u16>().ok(),
                    serde_yaml::Value::Number(port) => port.as_u64().and_then(|port| u16::try_from(port).ok()),
                    _ => None,
                };
                match port {
                    Some(port) => Ok(Node::new(server.server_id, server.host, port)),
                    None => Err(ClusterError::InvalidPort {
                        node: server.server_id,
                        port: format!("{:?}", server.port),
                    }),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::from_nodes(nodes)
    }

    /// Reads and parses a YAML cluster configuration file.
    pub fn from_path(path: &Path) -> Result<Self, ClusterError> {
        log::debug!("reading cluster config from {}", path.display());
        let document = fs::read_to_string(path).map_err(ClusterError::IO)?;
        let cluster = Self::from_yaml(&document)?;
        log::info!("loaded cluster config with {} nodes", cluster.size());

        return Ok(cluster);
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, ClusterError> {
        self.nodes.get(id).ok_or(ClusterError::UnknownNode(id))
    }
}

pub(crate) fn validate_size(size: usize) -> Result<(), ClusterError> {
    if size == 0 || size > MAX_CLUSTER_SIZE || !size.is_power_of_two() {
        return Err(ClusterError::InvalidSize(size));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use rstest::*;

    use super::{Cluster, ClusterError, Node};

    fn nodes(ids: &[usize]) -> Vec<Node> {
        ids.iter().map(|id| Node::new(*id, "127.0.0.1", 7000 + *id as u16)).collect()
    }

    #[test]
    fn test_from_yaml() {
        let document = r#"
servers:
  - serverId: 1
    host: "10.0.0.2"
    port: "8081"
  - serverId: 0
    host: "10.0.0.1"
    port: 8080
"#;
        let cluster = Cluster::from_yaml(document).unwrap();

        assert_eq!(cluster.size(), 2);
        assert_eq!(cluster.node(0).unwrap(), &Node::new(0, "10.0.0.1", 8080));
        assert_eq!(cluster.node(1).unwrap().address(), "10.0.0.2:8081");
        assert!(matches!(cluster.node(2), Err(ClusterError::UnknownNode(2))));
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "servers:\n  - serverId: 0\n    host: localhost\n    port: \"9000\"").unwrap();

        let cluster = Cluster::from_path(file.path()).unwrap();
        assert_eq!(cluster.nodes(), &[Node::new(0, "localhost", 9000)]);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Cluster::from_path(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ClusterError::IO(_)));
    }

    #[rstest]
    #[case("servers: [")]
    #[case("nodes: []")]
    fn test_unparsable(#[case] document: &str) {
        assert!(matches!(Cluster::from_yaml(document), Err(ClusterError::Parse(_))));
    }

    #[test]
    fn test_invalid_port() {
        let document = "servers:\n  - serverId: 0\n    host: localhost\n    port: \"http\"\n";
        assert!(matches!(
            Cluster::from_yaml(document),
            Err(ClusterError::InvalidPort { node: 0, .. })
        ));
    }

    #[rstest]
    #[case(&[], 0)]
    #[case(&[0, 1, 2], 3)]
    #[case(&[0, 1, 2, 3, 4, 5], 6)]
    fn test_invalid_size(#[case] ids: &[usize], #[case] size: usize) {
        assert!(matches!(Cluster::from_nodes(nodes(ids)), Err(ClusterError::InvalidSize(s)) if s == size));
    }

    #[rstest]
    #[case(&[0, 0], "duplicate")]
    #[case(&[0, 2], "missing")]
    #[case(&[1, 2], "missing")]
    #[case(&[0, 1, 1, 3], "duplicate")]
    fn test_sparse_ids(#[case] ids: &[usize], #[case] kind: &str) {
        let err = Cluster::from_nodes(nodes(ids)).unwrap_err();
        match kind {
            "duplicate" => assert!(matches!(err, ClusterError::DuplicateNode(_)), "{}", err),
            _ => assert!(matches!(err, ClusterError::MissingNode(_)), "{}", err),
        }
    }

    #[test]
    fn test_nodes_sorted_by_id() {
        let cluster = Cluster::from_nodes(nodes(&[3, 1, 0, 2])).unwrap();
        let ids: Vec<usize> = cluster.nodes().iter().map(|node| node.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }
}
