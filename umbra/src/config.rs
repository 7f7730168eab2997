//! Scenario configuration.
//!
//! The scenario file is XML: an `<umbra>` root carrying global
//! attributes, a `<topology>`, `<plugin>` declarations, and `<host>`
//! blocks with their `<process>` children. Parsing is strict: unknown
//! attributes, unknown elements and empty required attributes are fatal
//! — a typo in a scenario silently changing an experiment is worse than
//! an error at boot.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use sim_time::SimDuration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("root element must be <umbra>, found <{0}>")]
    WrongRoot(String),
    #[error("<{element}> does not accept attribute `{attribute}`")]
    UnknownAttribute { element: String, attribute: String },
    #[error("<{element}> requires attribute `{attribute}`")]
    MissingAttribute {
        element: String,
        attribute: &'static str,
    },
    #[error("attribute `{attribute}` on <{element}> must not be empty")]
    EmptyAttribute {
        element: String,
        attribute: String,
    },
    #[error("unexpected element <{0}>")]
    UnknownElement(String),
    #[error("attribute `{attribute}`: `{value}` is not a valid {expected}")]
    BadValue {
        attribute: String,
        value: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub stop_time: SimDuration,
    pub preload: Option<String>,
    pub environment: Option<String>,
    pub topology: TopologySource,
    pub plugins: Vec<PluginDecl>,
    pub hosts: Vec<HostDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologySource {
    Path(PathBuf),
    Inline(String),
    /// No `<topology>` element: a single fully connected cloud.
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDecl {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct HostDecl {
    pub id: String,
    pub iphint: Option<Ipv4Addr>,
    pub geocodehint: Option<String>,
    pub typehint: Option<String>,
    pub bandwidth_down: Option<u64>,
    pub bandwidth_up: Option<u64>,
    pub quantity: u32,
    pub cpu_frequency: Option<u64>,
    pub socket_recv_buffer: Option<usize>,
    pub socket_send_buffer: Option<usize>,
    pub interface_buffer: Option<usize>,
    pub log_level: Option<String>,
    pub heartbeat_log_level: Option<String>,
    pub heartbeat_log_info: Option<String>,
    pub heartbeat_frequency: Option<u64>,
    pub log_pcap: bool,
    pub pcap_dir: Option<PathBuf>,
    pub processes: Vec<ProcessDecl>,
}

#[derive(Debug, Clone)]
pub struct ProcessDecl {
    pub plugin: String,
    pub arguments: Vec<String>,
    pub start_time: SimDuration,
    pub stop_time: Option<SimDuration>,
    pub preload: Option<String>,
}

pub fn parse(text: &str) -> Result<Scenario, ConfigError> {
    let doc = roxmltree::Document::parse(text)?;
    let root = doc.root_element();

    if root.tag_name().name() != "umbra" {
        return Err(ConfigError::WrongRoot(root.tag_name().name().to_owned()));
    }

    let mut stop_time = None;
    let mut preload = None;
    let mut environment = None;

    for attribute in root.attributes() {
        match attribute.name() {
            "stoptime" => {
                stop_time = Some(SimDuration::from_secs(parse_number(
                    attribute.name(),
                    attribute.value(),
                )?));
            }
            "preload" => preload = Some(required_value("umbra", &attribute)?),
            "environment" => environment = Some(required_value("umbra", &attribute)?),
            other => {
                return Err(ConfigError::UnknownAttribute {
                    element: "umbra".to_owned(),
                    attribute: other.to_owned(),
                });
            }
        }
    }

    let stop_time = stop_time.ok_or(ConfigError::MissingAttribute {
        element: "umbra".to_owned(),
        attribute: "stoptime",
    })?;

    let mut topology = TopologySource::Default;
    let mut plugins = Vec::new();
    let mut hosts = Vec::new();

    for child in root.children().filter(roxmltree::Node::is_element) {
        match child.tag_name().name() {
            "topology" => topology = parse_topology(&child)?,
            "plugin" => plugins.push(parse_plugin(&child)?),
            "host" => hosts.push(parse_host(&child)?),
            other => return Err(ConfigError::UnknownElement(other.to_owned())),
        }
    }

    Ok(Scenario {
        stop_time,
        preload,
        environment,
        topology,
        plugins,
        hosts,
    })
}

fn parse_topology(node: &roxmltree::Node<'_, '_>) -> Result<TopologySource, ConfigError> {
    let mut path = None;

    for attribute in node.attributes() {
        match attribute.name() {
            "path" => path = Some(PathBuf::from(required_value(element_name(node), &attribute)?)),
            other => {
                return Err(ConfigError::UnknownAttribute {
                    element: "topology".to_owned(),
                    attribute: other.to_owned(),
                });
            }
        }
    }

    if let Some(path) = path {
        return Ok(TopologySource::Path(path));
    }

    let inline = node.text().map(str::trim).unwrap_or_default();
    if inline.is_empty() {
        return Ok(TopologySource::Default);
    }

    Ok(TopologySource::Inline(inline.to_owned()))
}

fn parse_plugin(node: &roxmltree::Node<'_, '_>) -> Result<PluginDecl, ConfigError> {
    let mut id = None;
    let mut path = None;

    for attribute in node.attributes() {
        match attribute.name() {
            "id" => id = Some(required_value(element_name(node), &attribute)?),
            "path" => path = Some(PathBuf::from(required_value(element_name(node), &attribute)?)),
            other => {
                return Err(ConfigError::UnknownAttribute {
                    element: "plugin".to_owned(),
                    attribute: other.to_owned(),
                });
            }
        }
    }

    Ok(PluginDecl {
        id: id.ok_or(ConfigError::MissingAttribute {
            element: "plugin".to_owned(),
            attribute: "id",
        })?,
        path: path.ok_or(ConfigError::MissingAttribute {
            element: "plugin".to_owned(),
            attribute: "path",
        })?,
    })
}

fn parse_host(node: &roxmltree::Node<'_, '_>) -> Result<HostDecl, ConfigError> {
    let mut host = HostDecl {
        id: String::new(),
        iphint: None,
        geocodehint: None,
        typehint: None,
        bandwidth_down: None,
        bandwidth_up: None,
        quantity: 1,
        cpu_frequency: None,
        socket_recv_buffer: None,
        socket_send_buffer: None,
        interface_buffer: None,
        log_level: None,
        heartbeat_log_level: None,
        heartbeat_log_info: None,
        heartbeat_frequency: None,
        log_pcap: false,
        pcap_dir: None,
        processes: Vec::new(),
    };
    let mut id = None;

    for attribute in node.attributes() {
        let value = required_value(element_name(node), &attribute)?;

        match attribute.name() {
            "id" => id = Some(value),
            "iphint" => {
                host.iphint =
                    Some(value.parse().map_err(|_| ConfigError::BadValue {
                        attribute: "iphint".to_owned(),
                        value,
                        expected: "IPv4 address",
                    })?);
            }
            "geocodehint" => host.geocodehint = Some(value),
            "typehint" => host.typehint = Some(value),
            "bandwidthdown" => host.bandwidth_down = Some(parse_number("bandwidthdown", &value)?),
            "bandwidthup" => host.bandwidth_up = Some(parse_number("bandwidthup", &value)?),
            "quantity" => host.quantity = parse_number("quantity", &value)? as u32,
            "cpufrequency" => host.cpu_frequency = Some(parse_number("cpufrequency", &value)?),
            "socketrecvbuffer" => {
                host.socket_recv_buffer = Some(parse_number("socketrecvbuffer", &value)? as usize);
            }
            "socketsendbuffer" => {
                host.socket_send_buffer = Some(parse_number("socketsendbuffer", &value)? as usize);
            }
            "interfacebuffer" => {
                host.interface_buffer = Some(parse_number("interfacebuffer", &value)? as usize);
            }
            "loglevel" => host.log_level = Some(value),
            "heartbeatloglevel" => host.heartbeat_log_level = Some(value),
            "heartbeatloginfo" => host.heartbeat_log_info = Some(value),
            "heartbeatfrequency" => {
                host.heartbeat_frequency = Some(parse_number("heartbeatfrequency", &value)?);
            }
            "logpcap" => {
                host.log_pcap = value == "true" || value == "1";
            }
            "pcapdir" => host.pcap_dir = Some(PathBuf::from(value)),
            other => {
                return Err(ConfigError::UnknownAttribute {
                    element: "host".to_owned(),
                    attribute: other.to_owned(),
                });
            }
        }
    }

    host.id = id.ok_or(ConfigError::MissingAttribute {
        element: "host".to_owned(),
        attribute: "id",
    })?;

    for child in node.children().filter(roxmltree::Node::is_element) {
        match child.tag_name().name() {
            "process" => host.processes.push(parse_process(&child)?),
            other => return Err(ConfigError::UnknownElement(other.to_owned())),
        }
    }

    Ok(host)
}

fn parse_process(node: &roxmltree::Node<'_, '_>) -> Result<ProcessDecl, ConfigError> {
    let mut plugin = None;
    let mut arguments = Vec::new();
    let mut start_time = None;
    let mut stop_time = None;
    let mut preload = None;

    for attribute in node.attributes() {
        let value = required_value(element_name(node), &attribute)?;

        match attribute.name() {
            "plugin" => plugin = Some(value),
            "arguments" => {
                arguments = value.split_whitespace().map(str::to_owned).collect();
            }
            "starttime" => {
                start_time = Some(SimDuration::from_secs(parse_number("starttime", &value)?));
            }
            "stoptime" => {
                stop_time = Some(SimDuration::from_secs(parse_number("stoptime", &value)?));
            }
            "preload" => preload = Some(value),
            other => {
                return Err(ConfigError::UnknownAttribute {
                    element: "process".to_owned(),
                    attribute: other.to_owned(),
                });
            }
        }
    }

    Ok(ProcessDecl {
        plugin: plugin.ok_or(ConfigError::MissingAttribute {
            element: "process".to_owned(),
            attribute: "plugin",
        })?,
        arguments,
        start_time: start_time.ok_or(ConfigError::MissingAttribute {
            element: "process".to_owned(),
            attribute: "starttime",
        })?,
        stop_time,
        preload,
    })
}

fn required_value(
    element: &str,
    attribute: &roxmltree::Attribute<'_, '_>,
) -> Result<String, ConfigError> {
    if attribute.value().is_empty() {
        return Err(ConfigError::EmptyAttribute {
            element: element.to_owned(),
            attribute: attribute.name().to_owned(),
        });
    }

    Ok(attribute.value().to_owned())
}

fn parse_number(attribute: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::BadValue {
        attribute: attribute.to_owned(),
        value: value.to_owned(),
        expected: "number",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        <umbra stoptime="60">
            <plugin id="pingpong" path="libpingpong.so"/>
            <host id="server" iphint="10.0.0.1" bandwidthdown="10240" bandwidthup="10240">
                <process plugin="pingpong" arguments="server 80" starttime="1"/>
            </host>
            <host id="client" quantity="3">
                <process plugin="pingpong" arguments="client server 80" starttime="2" stoptime="50"/>
            </host>
        </umbra>
    "#;

    #[test]
    fn parses_a_complete_scenario() {
        let scenario = parse(MINIMAL).unwrap();

        assert_eq!(scenario.stop_time, SimDuration::from_secs(60));
        assert_eq!(scenario.plugins.len(), 1);
        assert_eq!(scenario.hosts.len(), 2);

        let server = &scenario.hosts[0];
        assert_eq!(server.id, "server");
        assert_eq!(server.iphint, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(server.quantity, 1);

        let client = &scenario.hosts[1];
        assert_eq!(client.quantity, 3);
        assert_eq!(
            client.processes[0].arguments,
            vec!["client", "server", "80"]
        );
        assert_eq!(
            client.processes[0].stop_time,
            Some(SimDuration::from_secs(50))
        );
    }

    #[test]
    fn unknown_attribute_is_fatal() {
        let result = parse(r#"<umbra stoptime="1"><host id="a" colour="red"/></umbra>"#);

        assert!(matches!(
            result,
            Err(ConfigError::UnknownAttribute { attribute, .. }) if attribute == "colour"
        ));
    }

    #[test]
    fn empty_required_attribute_is_fatal() {
        let result = parse(r#"<umbra stoptime="1"><host id=""/></umbra>"#);

        assert!(matches!(result, Err(ConfigError::EmptyAttribute { .. })));
    }

    #[test]
    fn missing_stoptime_is_fatal() {
        assert!(matches!(
            parse("<umbra/>"),
            Err(ConfigError::MissingAttribute { attribute, .. }) if attribute == "stoptime"
        ));
    }

    #[test]
    fn unknown_element_is_fatal() {
        let result = parse(r#"<umbra stoptime="1"><router id="r"/></umbra>"#);

        assert!(matches!(result, Err(ConfigError::UnknownElement(e)) if e == "router"));
    }

    #[test]
    fn inline_topology_is_captured() {
        let scenario = parse(
            r#"<umbra stoptime="1"><topology><![CDATA[<graphml/>]]></topology></umbra>"#,
        )
        .unwrap();

        assert_eq!(
            scenario.topology,
            TopologySource::Inline("<graphml/>".to_owned())
        );
    }
}

fn element_name<'a>(node: &'a roxmltree::Node<'_, '_>) -> &'a str {
    node.tag_name().name()
}
