//! Filter expression builders for TLS verification traffic
//!
//! Every expression produced here is accepted by [`crate::compile`].

/// Filter for TLS traffic to or from a service port
///
/// This is the default filter used when none is given.
pub fn tls_filter(port: u16) -> String {
    format!("tcp and port {}", port)
}

/// TLS traffic between this host and one server
pub fn tls_server_filter(server: std::net::IpAddr, port: u16) -> String {
    format!("tcp and host {} and port {}", server, port)
}

/// TCP traffic on a port range
pub fn tcp_port_range_filter(start: u16, end: u16) -> String {
    format!("tcp portrange {}-{}", start, end)
}

/// Combine filters with AND
pub fn combine_filters(filters: &[&str]) -> String {
    join(filters, " and ")
}

/// Combine filters with OR
pub fn combine_filters_or(filters: &[&str]) -> String {
    join(filters, " or ")
}

/// Negate a filter
pub fn not_filter(filter: &str) -> String {
    format!("not ({})", filter)
}

fn join(filters: &[&str], separator: &str) -> String {
    let filters: Vec<&str> = filters
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .collect();
    match filters.as_slice() {
        [] => String::new(),
        [single] => single.to_string(),
        many => many
            .iter()
            .map(|f| format!("({})", f))
            .collect::<Vec<_>>()
            .join(separator),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile;

    #[test]
    fn test_tls_filters() {
        assert_eq!(tls_filter(443), "tcp and port 443");
        assert_eq!(
            tls_server_filter("2001:db8::1".parse().unwrap(), 8443),
            "tcp and host 2001:db8::1 and port 8443"
        );
        assert_eq!(tcp_port_range_filter(8000, 8999), "tcp portrange 8000-8999");
    }

    #[test]
    fn test_combine_filters() {
        assert_eq!(combine_filters(&[]), "");
        assert_eq!(combine_filters(&["tcp", " "]), "tcp");
        assert_eq!(
            combine_filters(&["tcp", "port 443"]),
            "(tcp) and (port 443)"
        );
        assert_eq!(
            combine_filters_or(&["port 443", "port 8443"]),
            "(port 443) or (port 8443)"
        );
        assert_eq!(not_filter("port 22"), "not (port 22)");
    }

    #[test]
    fn test_builders_compile() {
        let expressions = [
            tls_filter(443),
            tls_server_filter("93.184.216.34".parse().unwrap(), 443),
            tcp_port_range_filter(1, 1024),
            combine_filters(&[&tls_filter(443), &not_filter("host 10.0.0.1")]),
            combine_filters_or(&["port 443", "port 8443"]),
        ];
        for expression in &expressions {
            assert!(compile(expression, 2000).is_ok(), "{expression}");
        }
    }
}
