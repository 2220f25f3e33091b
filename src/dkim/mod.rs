//! DKIM signing over a canonical header set, tied to a domain's stored
//! private key and selector.

use mail_auth::common::crypto::{Ed25519Key, RsaKey, Sha256, SigningKey};
use mail_auth::common::headers::{HeaderWriter, Writable};
use mail_auth::dkim::DkimSigner;

use crate::models::{DkimKeyType, Domain};

const SIGNED_HEADERS: [&str; 26] = [
    "From",
    "Subject",
    "Date",
    "Message-ID",
    "To",
    "Cc",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
    "Content-ID",
    "Content-Description",
    "Resent-Date",
    "Resent-From",
    "Resent-Sender",
    "Resent-To",
    "Resent-Cc",
    "Resent-Message-ID",
    "In-Reply-To",
    "References",
    "List-Id",
    "List-Help",
    "List-Unsubscribe",
    "List-Subscribe",
    "List-Post",
    "List-Owner",
    "List-Archive",
];

enum Key {
    RsaSha256(RsaKey<Sha256>),
    Ed25519(Ed25519Key),
}

impl SigningKey for Key {
    type Hasher = Sha256;

    fn sign(&self, input: impl Writable) -> mail_auth::Result<Vec<u8>> {
        match self {
            Key::RsaSha256(k) => k.sign(input),
            Key::Ed25519(k) => k.sign(input),
        }
    }

    fn algorithm(&self) -> mail_auth::common::crypto::Algorithm {
        match self {
            Key::RsaSha256(k) => k.algorithm(),
            Key::Ed25519(k) => k.algorithm(),
        }
    }
}

/// A domain's DKIM signing identity, built fresh from its stored private
/// key for each sign — nothing here is cached across messages.
pub struct PrivateKey<'a> {
    domain: &'a str,
    selector: &'a str,
    key: Key,
}

impl<'a> PrivateKey<'a> {
    pub fn new(domain: &'a Domain) -> Result<Self, mail_auth::Error> {
        let key = match domain.dkim_key_type {
            DkimKeyType::RsaSha256 => {
                Key::RsaSha256(RsaKey::<Sha256>::from_pkcs8_der(&domain.dkim_private_key)?)
            }
            DkimKeyType::Ed25519 => {
                Key::Ed25519(Ed25519Key::from_pkcs8_der(&domain.dkim_private_key)?)
            }
        };

        Ok(Self {
            domain: &domain.domain,
            selector: &domain.dkim_selector,
            key,
        })
    }

    pub fn dkim_header(self, msg: &mail_parser::Message) -> Result<String, mail_auth::Error> {
        let signer = DkimSigner::from_key(self.key)
            .domain(self.domain)
            .selector(self.selector)
            .headers(SIGNED_HEADERS);

        signer.sign(msg.raw_message()).map(|sig| sig.to_header())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ids::{DomainId, TenantId};
    use crate::models::DkimKeyType;
    use aws_lc_rs::encoding::AsDer;
    use mail_parser::MessageParser;

    fn test_domain() -> Domain {
        let pkcs8 = aws_lc_rs::rsa::KeyPair::generate(aws_lc_rs::rsa::KeySize::Rsa2048)
            .unwrap()
            .as_der()
            .unwrap()
            .as_ref()
            .to_vec();

        Domain {
            id: DomainId::new(),
            tenant_id: TenantId::new(),
            domain: "example.com".to_string(),
            verified: true,
            dkim_selector: "sendlane".to_string(),
            dkim_key_type: DkimKeyType::RsaSha256,
            dkim_private_key: pkcs8,
            created_at: chrono::Utc::now(),
            verified_at: Some(chrono::Utc::now()),
        }
    }

    #[test]
    fn signs_a_message() {
        let domain = test_domain();
        let raw = b"From: a@example.com\r\nTo: b@example.com\r\nSubject: hi\r\nDate: Tue, 1 Jan 2030 00:00:00 +0000\r\nMessage-ID: <1@example.com>\r\n\r\nhello\r\n";
        let parsed = MessageParser::default().parse(raw).unwrap();

        let header = PrivateKey::new(&domain).unwrap().dkim_header(&parsed).unwrap();
        assert!(header.contains("d=example.com"));
        assert!(header.contains("s=sendlane"));
    }
}
