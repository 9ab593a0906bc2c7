//! Token access in-process, against mock token libraries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use openssl::hash::MessageDigest;
use openssl::sign::Verifier;

use tokenkeeper::api::sign::{HashAlgorithm, SignaturePadding};
use tokenkeeper::client::{TokenAccessClient, TokenKey};
use tokenkeeper::commons::error::TokenError;
use tokenkeeper::test::{MockToken, mock_access, mock_credential};
use tokenkeeper::token::credential::ClientCredential;

fn init_logging() {
    let _ = stderrlog::new().verbosity(2).init();
}

fn sha256(data: &[u8]) -> Vec<u8> {
    openssl::sha::sha256(data).to_vec()
}

#[test]
fn certificate_sign_and_verify() {
    init_logging();
    let token = MockToken::new("T1");
    let id = token.thumbprint();
    let (_loader, access) = mock_access(vec![token.clone()]);
    let credential = mock_credential("acme", "client1", "T1", "1234");

    let cert = access.get_certificate(&credential, &id).unwrap();
    assert_eq!(cert, token.certificate());

    let hash = sha256(b"tokenkeeper");
    for padding in [SignaturePadding::Pkcs1, SignaturePadding::Pss] {
        let signature = access
            .rsa_sign_hash(&credential, &id, &hash, HashAlgorithm::Sha256, padding)
            .unwrap();
        assert_eq!(signature.len(), 256);
        assert!(access
            .rsa_verify_hash(
                &credential,
                &id,
                &hash,
                &signature,
                HashAlgorithm::Sha256,
                padding
            )
            .unwrap());

        let other = sha256(b"something else");
        assert!(!access
            .rsa_verify_hash(
                &credential,
                &id,
                &other,
                &signature,
                HashAlgorithm::Sha256,
                padding
            )
            .unwrap());
    }
}

#[test]
fn certificate_id_is_case_insensitive() {
    let token = MockToken::new("T1");
    let id = token.thumbprint();
    let (loader, access) = mock_access(vec![token]);
    let credential = mock_credential("acme", "client1", "T1", "1234");

    access.get_certificate(&credential, &id).unwrap();
    access
        .get_certificate(&credential, &id.to_lowercase())
        .unwrap();
    assert_eq!(access.cache().cached_certificates(), 1);
    assert_eq!(loader.opens(), 1);
}

#[test]
fn second_token_of_tenant_is_found() {
    let first = MockToken::new("T1");
    let second = MockToken::new("T2");
    let id = second.thumbprint();
    let (_loader, access) = mock_access(vec![first, second.clone()]);

    // The secret was derived for T2 only.
    let credential = mock_credential("acme", "client1", "T2", "5678");
    assert_eq!(
        access.get_certificate(&credential, &id).unwrap(),
        second.certificate()
    );
}

#[test]
fn credential_errors() {
    let token = MockToken::new("T1");
    let id = token.thumbprint();
    let (_loader, access) = mock_access(vec![token]);

    let wrong = ClientCredential::new("acme", "client1", "guessed").encode();
    assert!(matches!(
        access.get_certificate(&wrong, &id),
        Err(TokenError::Credential(_))
    ));

    let unknown = mock_credential("initech", "client1", "T1", "1234");
    assert!(matches!(
        access.get_certificate(&unknown, &id),
        Err(TokenError::Credential(_))
    ));

    assert!(matches!(
        access.get_certificate("", &id),
        Err(TokenError::Credential(_))
    ));
    assert_eq!(access.cache().invalidations(), 0);
}

#[test]
fn tenants_do_not_see_each_others_tokens() {
    let token = MockToken::new("T1");
    let id = token.thumbprint();
    let (_loader, access) = mock_access(vec![token, MockToken::new("T3")]);

    let credential = mock_credential("other", "client1", "T3", "9999");
    assert!(matches!(
        access.get_certificate(&credential, &id),
        Err(TokenError::CertificateNotFound(_))
    ));
    assert_eq!(access.cache().invalidations(), 0);
}

#[test]
fn wrong_hash_length_fails_before_token_access() {
    let token = MockToken::new("T1");
    let id = token.thumbprint();
    let (loader, access) = mock_access(vec![token]);
    let credential = mock_credential("acme", "client1", "T1", "1234");

    let res = access.rsa_sign_hash(
        &credential,
        &id,
        &[0; 20],
        HashAlgorithm::Sha256,
        SignaturePadding::Pkcs1,
    );
    assert!(matches!(res, Err(TokenError::InvalidInput(_))));
    assert_eq!(loader.opens(), 0);
}

#[test]
fn driver_failure_is_retried_after_invalidation() {
    init_logging();
    let token = MockToken::new("T1");
    let id = token.thumbprint();
    let (loader, access) = mock_access(vec![token]);
    let credential = mock_credential("acme", "client1", "T1", "1234");
    let hash = sha256(b"retry");

    access
        .rsa_sign_hash(&credential, &id, &hash, HashAlgorithm::Sha256, SignaturePadding::Pkcs1)
        .unwrap();

    loader.fail_next(1);
    access
        .rsa_sign_hash(&credential, &id, &hash, HashAlgorithm::Sha256, SignaturePadding::Pkcs1)
        .unwrap();

    assert_eq!(access.cache().invalidations(), 1);
    assert_eq!(loader.opens(), 2);
    assert_eq!(loader.closes(), 1);
}

#[test]
fn persistent_driver_failure_is_returned() {
    let token = MockToken::new("T1");
    let id = token.thumbprint();
    let (loader, access) = mock_access(vec![token]);
    let credential = mock_credential("acme", "client1", "T1", "1234");

    loader.fail_next(100);
    assert!(matches!(
        access.get_certificate(&credential, &id),
        Err(TokenError::Driver(_))
    ));
    assert_eq!(access.cache().invalidations(), 1);
}

#[test]
fn missing_certificate_is_not_retried() {
    let (loader, access) = mock_access(vec![MockToken::new("T1")]);
    let credential = mock_credential("acme", "client1", "T1", "1234");

    assert!(matches!(
        access.get_certificate(&credential, "00112233"),
        Err(TokenError::CertificateNotFound(_))
    ));
    assert_eq!(access.cache().invalidations(), 0);
    assert_eq!(loader.opens(), 1);
}

#[test]
fn removed_token_is_retried_and_found_after_reinsert() {
    let token = MockToken::new("T1");
    let id = token.thumbprint();
    let (loader, access) = mock_access(vec![token]);
    let credential = mock_credential("acme", "client1", "T1", "1234");
    let hash = sha256(b"unplugged");

    access.get_certificate(&credential, &id).unwrap();

    // The cached certificate points to a token that is gone. Signing fails
    // in the driver, the retry searches again and finds no token.
    loader.remove_token("T1");
    let res = access.rsa_sign_hash(
        &credential,
        &id,
        &hash,
        HashAlgorithm::Sha256,
        SignaturePadding::Pss,
    );
    assert!(matches!(res, Err(TokenError::CertificateNotFound(_))));
    assert_eq!(access.cache().invalidations(), 1);

    // With no token present, not finding the certificate is worth another
    // try, too.
    assert!(matches!(
        access.get_certificate(&credential, &id),
        Err(TokenError::CertificateNotFound(_))
    ));
    assert_eq!(access.cache().invalidations(), 2);

    // The libraries were opened while the token was out. Not finding the
    // certificate reopens them, which picks the token up again.
    loader.insert_token("T1");
    let signature = access
        .rsa_sign_hash(&credential, &id, &hash, HashAlgorithm::Sha256, SignaturePadding::Pss)
        .unwrap();
    assert!(access
        .rsa_verify_hash(
            &credential,
            &id,
            &hash,
            &signature,
            HashAlgorithm::Sha256,
            SignaturePadding::Pss
        )
        .unwrap());
    assert_eq!(access.cache().invalidations(), 3);
}

#[test]
fn token_inserted_after_enumeration_is_found() {
    let token = MockToken::new("T1");
    let id = token.thumbprint();
    let (loader, access) = mock_access(vec![token.clone()]);
    let credential = mock_credential("acme", "client1", "T1", "1234");

    loader.remove_token("T1");
    let infos = access.get_token_infos().unwrap();
    assert!(infos[0].tokens.is_empty());

    loader.insert_token("T1");
    let cert = access.get_certificate(&credential, &id).unwrap();
    assert_eq!(AsRef::<[u8]>::as_ref(&cert), token.certificate());
    assert_eq!(access.cache().invalidations(), 1);
    assert_eq!(loader.opens(), 2);
}

#[test]
fn locked_pin_is_a_health_error() {
    let token = MockToken::new("T1");
    let id = token.thumbprint();
    let (loader, access) = mock_access(vec![token, MockToken::new("T2")]);
    let credential = mock_credential("acme", "client1", "T1", "1234");

    // Any unhealthy token blocks the search, not just the one we want.
    loader.set_user_pin_locked("T2", true);
    match access.get_certificate(&credential, &id) {
        Err(TokenError::TokenHealth(msg)) => {
            assert!(msg.contains("T2"));
            assert!(msg.contains("user PIN locked"));
        }
        other => panic!("expected health error, got {other:?}"),
    }
    assert_eq!(access.cache().invalidations(), 0);

    loader.set_user_pin_locked("T2", false);
    access.get_certificate(&credential, &id).unwrap();
}

#[test]
fn token_infos_of_every_library() {
    let (_loader, access) =
        mock_access(vec![MockToken::new("T1"), MockToken::new("T2")]);
    let infos = access.get_token_infos().unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].library.library_description, "Mock token library");
    assert_eq!(infos[0].slots.len(), 2);
    let serials: Vec<_> =
        infos[0].tokens.iter().map(|t| t.serial_number.as_str()).collect();
    assert_eq!(serials, ["T1", "T2"]);
}

#[test]
fn concurrent_signing_survives_invalidation() {
    let token = MockToken::new("T1");
    let id = token.thumbprint();
    let (loader, access) = mock_access(vec![token]);
    let credential = mock_credential("acme", "client1", "T1", "1234");
    let done = Arc::new(AtomicBool::new(false));

    let invalidator = {
        let access = access.clone();
        let done = done.clone();
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                access.cache().invalidate_all();
                thread::sleep(Duration::from_millis(5));
            }
        })
    };

    let signers: Vec<_> = (0..8)
        .map(|i| {
            let access = access.clone();
            let credential = credential.clone();
            let id = id.clone();
            thread::spawn(move || {
                let hash = sha256(format!("signer {i}").as_bytes());
                for _ in 0..20 {
                    let signature = access
                        .rsa_sign_hash(
                            &credential,
                            &id,
                            &hash,
                            HashAlgorithm::Sha256,
                            SignaturePadding::Pkcs1,
                        )
                        .unwrap();
                    assert!(access
                        .rsa_verify_hash(
                            &credential,
                            &id,
                            &hash,
                            &signature,
                            HashAlgorithm::Sha256,
                            SignaturePadding::Pkcs1,
                        )
                        .unwrap());
                }
            })
        })
        .collect();

    for signer in signers {
        signer.join().unwrap();
    }
    done.store(true, Ordering::Release);
    invalidator.join().unwrap();

    access.cache().invalidate_all();
    assert_eq!(loader.opens(), loader.closes());
    assert_eq!(access.cache().cached_stores(), 0);
}

#[tokio::test]
async fn token_key_signs_through_local_client() {
    let token = MockToken::new("T1");
    let id = token.thumbprint();
    let (_loader, access) = mock_access(vec![token]);
    let credential = mock_credential("acme", "client1", "T1", "1234");

    let client = TokenAccessClient::local(access);
    let key = TokenKey::open(client, &credential, &id).await.unwrap();
    assert_eq!(key.key_size(), 2048);
    assert_eq!(key.certificate_id(), id);

    let data = b"signed through a token key";
    let hash = sha256(data);
    let signature = key
        .sign_hash(&hash, HashAlgorithm::Sha256, SignaturePadding::Pkcs1)
        .await
        .unwrap();

    let mut verifier =
        Verifier::new(MessageDigest::sha256(), key.public_key()).unwrap();
    verifier.update(data).unwrap();
    assert!(verifier.verify(&signature).unwrap());

    assert!(key
        .verify_hash(&hash, &signature, HashAlgorithm::Sha256, SignaturePadding::Pkcs1)
        .await
        .unwrap());

    assert!(matches!(
        key.sign_hash(&[], HashAlgorithm::Sha256, SignaturePadding::Pkcs1)
            .await,
        Err(TokenError::InvalidInput(_))
    ));
    assert!(matches!(
        key.verify_hash(&hash, &[], HashAlgorithm::Sha256, SignaturePadding::Pss)
            .await,
        Err(TokenError::InvalidInput(_))
    ));
}
