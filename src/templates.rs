//! OpenVPN profile templates.
//!
//! Server and client profiles are rendered as plain text with the CA
//! certificate, identity certificate, private key and (for the server) CRL
//! and DH parameters embedded inline, so each profile is self-contained.

use std::fmt::Write;

use crate::configs::NetworkDefaults;
use crate::pki_generator::Algorithm;

const HEADER: &str = "#-- Config auto generated by vpn-pki --#";
const SERVER_NETWORK: &str = "10.8.0.0 255.255.255.0";

/// Material embedded into a server profile
pub struct ServerProfile<'a> {
    pub network: &'a NetworkDefaults,
    pub algorithm: Algorithm,
    pub curve: &'a str,
    pub suffix: &'a str,
    pub ca_pem: &'a str,
    pub cert_pem: &'a str,
    pub key_pem: &'a str,
    pub dh_pem: Option<&'a str>,
    pub crl_pem: Option<&'a str>,
}

/// Material embedded into a client profile
pub struct ClientProfile<'a> {
    pub name: &'a str,
    pub network: &'a NetworkDefaults,
    pub ca_pem: &'a str,
    pub cert_pem: &'a str,
    pub key_pem: &'a str,
}

fn inline_block(out: &mut String, tag: &str, pem: &str) {
    let _ = writeln!(out, "<{}>", tag);
    out.push_str(pem.trim_end());
    let _ = writeln!(out, "\n</{}>", tag);
}

pub fn render_server_profile(profile: &ServerProfile<'_>) -> String {
    let network = profile.network;
    let suffix = profile.suffix;
    let mut out = String::new();

    let _ = writeln!(out, "{}", HEADER);
    let _ = writeln!(out, "#-- Config for OpenVPN 2.4+ server --#\n");
    let _ = writeln!(out, "proto {}", network.protocol.server_directive());
    let _ = writeln!(out, "port {}", network.port);
    out.push_str("dev tun0\n");
    let _ = writeln!(out, "server {}", SERVER_NETWORK);
    let _ = writeln!(out, "ifconfig-pool-persist ipp{}.txt", suffix);
    out.push_str("keepalive 10 120\n");
    out.push_str("user nobody\ngroup nogroup\n");
    out.push_str("persist-key\npersist-tun\n");
    let _ = writeln!(out, "status openvpn-status{}.log", suffix);
    out.push_str("verb 3\nmute 10\n");

    match profile.algorithm {
        Algorithm::Rsa => {
            if profile.dh_pem.is_none() {
                out.push_str("dh none\n");
            }
        }
        Algorithm::Eddsa => {
            out.push_str("dh none\n");
            let _ = writeln!(out, "ecdh-curve {}", profile.curve);
            out.push_str("tls-cipher TLS_AES_256_GCM_SHA384\n");
        }
        Algorithm::Ecdsa => {
            out.push_str("tls-version-min 1.2\n");
            out.push_str("dh none\n");
            let _ = writeln!(out, "ecdh-curve {}", profile.curve);
            out.push_str("tls-cipher TLS-ECDHE-ECDSA-WITH-AES-256-GCM-SHA384\n");
        }
    }

    for server in &network.dns {
        let _ = writeln!(out, "push \"dhcp-option DNS {}\"", server);
    }
    if network.redirect_gateway {
        out.push_str("push \"redirect-gateway def1\"\n");
    }
    out.push_str("#Uncomment the below to allow client to client communication\n#client-to-client\n");
    out.push_str("#Uncomment the below and modify the command to allow access to your internal network\n");
    out.push_str("#push \"route 192.168.0.0 255.255.255.0\"\n");

    inline_block(&mut out, "ca", profile.ca_pem);
    inline_block(&mut out, "cert", profile.cert_pem);
    inline_block(&mut out, "key", profile.key_pem);
    if profile.algorithm == Algorithm::Rsa {
        if let Some(dh) = profile.dh_pem {
            inline_block(&mut out, "dh", dh);
        }
    }
    if let Some(crl) = profile.crl_pem {
        inline_block(&mut out, "crl-verify", crl);
    }
    out
}

pub fn render_client_profile(profile: &ClientProfile<'_>) -> String {
    let network = profile.network;
    let mut out = String::new();

    let _ = writeln!(out, "{}\n", HEADER);
    let _ = writeln!(out, "#viscosity name {}@{}", profile.name, network.address);
    let _ = writeln!(
        out,
        "remote {} {} {}",
        network.address,
        network.port,
        network.protocol.client_directive()
    );
    out.push_str("dev tun\ntls-client\n");
    out.push_str("remote-cert-tls server\n");
    out.push_str("persist-tun\npersist-key\nnobind\npull\n");
    inline_block(&mut out, "ca", profile.ca_pem);
    inline_block(&mut out, "cert", profile.cert_pem);
    inline_block(&mut out, "key", profile.key_pem);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::Protocol;

    fn network() -> NetworkDefaults {
        NetworkDefaults {
            address: "vpn.example.com".to_string(),
            port: 443,
            protocol: Protocol::Tcp,
            dns: vec!["1.1.1.1".to_string()],
            redirect_gateway: true,
        }
    }

    #[test]
    fn test_client_profile_remote_and_inline_material() {
        let network = network();
        let text = render_client_profile(&ClientProfile {
            name: "alice",
            network: &network,
            ca_pem: "CA-PEM\n",
            cert_pem: "CERT-PEM",
            key_pem: "KEY-PEM",
        });
        assert!(text.contains("remote vpn.example.com 443 tcp-client\n"));
        assert!(text.contains("#viscosity name alice@vpn.example.com\n"));
        assert!(text.contains("<ca>\nCA-PEM\n</ca>\n"));
        assert!(text.contains("<key>\nKEY-PEM\n</key>\n"));
    }

    #[test]
    fn test_server_profile_rsa_with_dh_and_crl() {
        let network = network();
        let text = render_server_profile(&ServerProfile {
            network: &network,
            algorithm: Algorithm::Rsa,
            curve: "",
            suffix: "-2",
            ca_pem: "CA",
            cert_pem: "CERT",
            key_pem: "KEY",
            dh_pem: Some("DH"),
            crl_pem: Some("CRL"),
        });
        assert!(text.contains("proto tcp-server\n"));
        assert!(text.contains("status openvpn-status-2.log\n"));
        assert!(text.contains("<dh>\nDH\n</dh>\n"));
        assert!(text.contains("<crl-verify>\nCRL\n</crl-verify>\n"));
        assert!(text.contains("push \"dhcp-option DNS 1.1.1.1\"\n"));
        assert!(!text.contains("dh none"));
    }

    #[test]
    fn test_server_profile_ecdsa_uses_ecdh() {
        let network = network();
        let text = render_server_profile(&ServerProfile {
            network: &network,
            algorithm: Algorithm::Ecdsa,
            curve: "secp384r1",
            suffix: "",
            ca_pem: "CA",
            cert_pem: "CERT",
            key_pem: "KEY",
            dh_pem: Some("DH"),
            crl_pem: None,
        });
        assert!(text.contains("dh none\n"));
        assert!(text.contains("ecdh-curve secp384r1\n"));
        assert!(!text.contains("<dh>"));
        assert!(!text.contains("crl-verify"));
    }
}
