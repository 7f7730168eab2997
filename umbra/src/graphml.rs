//! Consumes GraphML topology documents into the routing graph.
//!
//! Only the shape the simulator needs is read: `<node>` ids, `<edge>`
//! endpoints, and the `latency` (milliseconds) / `packetloss` (fraction)
//! properties carried in `<data>` children, resolved through the
//! document's `<key>` declarations.

use std::collections::HashMap;

use anyhow::{Context as _, Result, bail};
use sim_time::SimDuration;
use topology::Topology;

/// Edge latency assumed when the document does not specify one.
const DEFAULT_LATENCY: SimDuration = SimDuration::from_millis(10);

pub fn parse(text: &str) -> Result<Topology> {
    let doc = roxmltree::Document::parse(text).context("Invalid GraphML")?;

    // Map key ids ("d0", "d1", ...) to attribute names.
    let mut key_names: HashMap<String, String> = HashMap::new();
    for key in doc.descendants().filter(|n| n.has_tag_name("key")) {
        if let (Some(id), Some(name)) = (key.attribute("id"), key.attribute("attr.name")) {
            key_names.insert(id.to_owned(), name.to_owned());
        }
    }

    let mut builder = Topology::builder();

    for node in doc.descendants().filter(|n| n.has_tag_name("node")) {
        let id = node.attribute("id").context("<node> without id")?;

        builder.vertex(id)?;
    }

    for edge in doc.descendants().filter(|n| n.has_tag_name("edge")) {
        let source = edge.attribute("source").context("<edge> without source")?;
        let target = edge.attribute("target").context("<edge> without target")?;

        let mut latency = DEFAULT_LATENCY;
        let mut packet_loss = 0.0;

        for data in edge.children().filter(|n| n.has_tag_name("data")) {
            let Some(key) = data.attribute("key") else {
                continue;
            };
            let name = key_names.get(key).map(String::as_str).unwrap_or(key);
            let value = data.text().unwrap_or_default().trim();

            match name {
                "latency" => {
                    let ms: f64 = value
                        .parse()
                        .with_context(|| format!("Bad latency `{value}`"))?;
                    latency = SimDuration::from_secs_f64(ms / 1000.0);
                }
                "packetloss" => {
                    packet_loss = value
                        .parse()
                        .with_context(|| format!("Bad packetloss `{value}`"))?;
                }
                // Bandwidth and geocode properties are host-level concerns
                // resolved elsewhere; ignore them on edges.
                _ => {}
            }
        }

        builder.link(source, target, latency, packet_loss)?;
    }

    let topology = builder.build()?;

    if topology.vertices().is_empty() {
        bail!("Topology has no vertices");
    }

    Ok(topology)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
        <graphml>
          <key id="d0" attr.name="latency" for="edge"/>
          <key id="d1" attr.name="packetloss" for="edge"/>
          <graph edgedefault="undirected">
            <node id="east"/>
            <node id="west"/>
            <edge source="east" target="west">
              <data key="d0">25</data>
              <data key="d1">0.01</data>
            </edge>
            <edge source="east" target="east">
              <data key="d0">1</data>
            </edge>
          </graph>
        </graphml>
    "#;

    #[test]
    fn reads_nodes_edges_and_properties() {
        let topology = parse(DOC).unwrap();

        assert_eq!(topology.vertices(), vec!["east", "west"]);
        assert_eq!(topology.min_latency(), SimDuration::from_millis(1));

        topology.attach("10.0.0.1".parse().unwrap(), "east").unwrap();
        topology.attach("10.0.0.2".parse().unwrap(), "west").unwrap();

        assert_eq!(
            topology.latency("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()),
            Some(SimDuration::from_millis(25))
        );
    }

    #[test]
    fn missing_latency_falls_back_to_default() {
        let doc = r#"
            <graphml><graph>
              <node id="a"/><node id="b"/>
              <edge source="a" target="b"/>
            </graph></graphml>
        "#;

        let topology = parse(doc).unwrap();

        assert_eq!(topology.min_latency(), DEFAULT_LATENCY);
    }

    #[test]
    fn unknown_vertex_reference_fails() {
        let doc = r#"
            <graphml><graph>
              <node id="a"/>
              <edge source="a" target="ghost"/>
            </graph></graphml>
        "#;

        assert!(parse(doc).is_err());
    }
}
