use crate::extension::Extension;
use crate::managed::ComponentContext;
use serde_json::json;
use trellis_core::shoot::DnsSpec;

/// Which of the two API server records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsRecordPurpose {
    /// `api.internal.<domain>`, used by components inside the seed
    Internal,
    /// `api.<domain>`, the address handed to users
    External,
}

impl DnsRecordPurpose {
    pub fn suffix(&self) -> &'static str {
        match self {
            DnsRecordPurpose::Internal => "internal",
            DnsRecordPurpose::External => "external",
        }
    }
}

/// DNS record pointing at the API server load balancer
///
/// `address` may be an IP (A record) or a hostname (CNAME).
pub fn dns_record(
    ctx: &ComponentContext,
    namespace: &str,
    shoot_name: &str,
    purpose: DnsRecordPurpose,
    dns: Option<&DnsSpec>,
    address: &str,
) -> Extension {
    let domain = dns.map(|d| d.domain.as_str()).unwrap_or_default();
    let fqdn = match purpose {
        DnsRecordPurpose::Internal => format!("api.internal.{}", domain),
        DnsRecordPurpose::External => format!("api.{}", domain),
    };
    let record_type = if address.parse::<std::net::IpAddr>().is_ok() {
        "A"
    } else {
        "CNAME"
    };
    let provider = dns
        .and_then(|d| d.provider.clone())
        .unwrap_or_else(|| "default".to_string());

    Extension::new(
        ctx,
        "DNSRecord",
        namespace,
        &format!("{}-{}", shoot_name, purpose.suffix()),
        json!({
            "type": provider,
            "name": fqdn,
            "recordType": record_type,
            "values": [address],
            "ttl": 120,
        }),
    )
}
