//! Static introspection data for the forwarded object.
//!
//! The XML mirrors what the upstream broker reports about itself, so generic
//! tooling (busctl, d-spy) sees the same interface on the host as inside the
//! container.

use std::fmt::Write;

use crate::endpoint::{BrokerEndpoint, IN_ARGS, OUT_ARG};

pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

const STANDARD_INTERFACES: &str = r#"  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg name="out" type="s" direction="out"/>
    </method>
  </interface>
  <interface name="org.freedesktop.DBus.Peer">
    <method name="Ping"/>
    <method name="GetMachineId">
      <arg name="machine_uuid" type="s" direction="out"/>
    </method>
  </interface>
"#;

/// Introspection XML for the broker object itself.
pub fn object_xml(endpoint: &BrokerEndpoint) -> String {
    let mut xml = String::from(DOCTYPE);
    xml.push_str("<node>\n");
    let _ = writeln!(xml, "  <interface name=\"{}\">", endpoint.interface_name);
    for method in endpoint.methods() {
        let _ = writeln!(xml, "    <method name=\"{}\">", method.wire_name());
        for arg in IN_ARGS {
            let _ = writeln!(xml, "      <arg name=\"{arg}\" type=\"s\" direction=\"in\"/>");
        }
        let _ = writeln!(xml, "      <arg name=\"{OUT_ARG}\" type=\"s\" direction=\"out\"/>");
        xml.push_str("    </method>\n");
    }
    xml.push_str("  </interface>\n");
    xml.push_str(STANDARD_INTERFACES);
    xml.push_str("</node>\n");
    xml
}

/// Introspection XML for an ancestor of the broker object path.
///
/// `/`, `/com` and so on answer with their next child node so tree-walking
/// tools can find the object. Returns `None` for paths that are not strict
/// ancestors of the object path.
pub fn ancestor_xml(endpoint: &BrokerEndpoint, path: &str) -> Option<String> {
    let child = child_segment(&endpoint.object_path, path)?;
    let mut xml = String::from(DOCTYPE);
    xml.push_str("<node>\n");
    xml.push_str(STANDARD_INTERFACES);
    let _ = writeln!(xml, "  <node name=\"{child}\"/>");
    xml.push_str("</node>\n");
    Some(xml)
}

fn child_segment<'a>(object_path: &'a str, path: &str) -> Option<&'a str> {
    let rest = if path == "/" {
        object_path.strip_prefix('/')?
    } else {
        object_path.strip_prefix(path)?.strip_prefix('/')?
    };
    rest.split('/').next().filter(|segment| !segment.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::BrokerMethod;

    #[test]
    fn test_object_xml_lists_exactly_the_broker_methods() {
        let endpoint = BrokerEndpoint::microsoft_identity();
        let xml = object_xml(&endpoint);

        assert!(xml.contains(r#"<interface name="com.microsoft.identity.Broker1">"#));
        for method in BrokerMethod::ALL {
            let tag = format!(r#"<method name="{}">"#, method.wire_name());
            assert_eq!(xml.matches(&tag).count(), 1, "missing {tag}");
        }

        // Eight broker methods plus Introspect, Ping and GetMachineId.
        assert_eq!(xml.matches("<method ").count(), 11);
    }

    #[test]
    fn test_object_xml_argument_directions() {
        let xml = object_xml(&BrokerEndpoint::microsoft_identity());

        assert_eq!(
            xml.matches(r#"<arg name="protocolVersion" type="s" direction="in"/>"#).count(),
            8
        );
        assert_eq!(
            xml.matches(r#"<arg name="correlationID" type="s" direction="in"/>"#).count(),
            8
        );
        assert_eq!(
            xml.matches(r#"<arg name="requestJSON" type="s" direction="in"/>"#).count(),
            8
        );
        assert_eq!(
            xml.matches(r#"<arg name="responseJSON" type="s" direction="out"/>"#).count(),
            8
        );
    }

    #[test]
    fn test_object_xml_argument_order() {
        let xml = object_xml(&BrokerEndpoint::microsoft_identity());
        let start = xml.find(r#"<method name="getAccounts">"#).unwrap();
        let method = &xml[start..start + xml[start..].find("</method>").unwrap()];

        let pv = method.find("protocolVersion").unwrap();
        let cid = method.find("correlationID").unwrap();
        let req = method.find("requestJSON").unwrap();
        let resp = method.find("responseJSON").unwrap();
        assert!(pv < cid && cid < req && req < resp);
    }

    #[test]
    fn test_object_xml_is_stable() {
        let endpoint = BrokerEndpoint::microsoft_identity();
        assert_eq!(object_xml(&endpoint), object_xml(&endpoint));
    }

    #[test]
    fn test_ancestor_xml_points_to_next_child() {
        let endpoint = BrokerEndpoint::microsoft_identity();

        let root = ancestor_xml(&endpoint, "/").unwrap();
        assert!(root.contains(r#"<node name="com"/>"#));

        let com = ancestor_xml(&endpoint, "/com").unwrap();
        assert!(com.contains(r#"<node name="microsoft"/>"#));

        let identity = ancestor_xml(&endpoint, "/com/microsoft/identity").unwrap();
        assert!(identity.contains(r#"<node name="broker1"/>"#));
    }

    #[test]
    fn test_ancestor_xml_rejects_unrelated_paths() {
        let endpoint = BrokerEndpoint::microsoft_identity();
        assert!(ancestor_xml(&endpoint, "/org").is_none());
        assert!(ancestor_xml(&endpoint, "/com/micro").is_none());
        assert!(ancestor_xml(&endpoint, "/com/microsoft/identity/broker1").is_none());
    }
}
