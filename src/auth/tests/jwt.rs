// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#[cfg(test)]
mod tests {
    use base64::prelude::{BASE64_URL_SAFE_NO_PAD, Engine as _};
    use cloud_credentials::clock::Clock;
    use cloud_credentials::jwt::certs::StaticCerts;
    use cloud_credentials::jwt::{ClaimsBuilder, Decoder, encode};
    use cloud_credentials::signer::{PublicKey, Signer};
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::rand_core::OsRng;
    use serde_json::json;
    use std::sync::{Arc, LazyLock, Mutex};
    use std::time::Duration;
    use time::OffsetDateTime;

    type TestResult = anyhow::Result<()>;

    static RSA_KEY: LazyLock<rsa::RsaPrivateKey> =
        LazyLock::new(|| rsa::RsaPrivateKey::new(&mut OsRng, 2048).expect("RSA key generation"));

    fn signer() -> anyhow::Result<Signer> {
        let pem = RSA_KEY
            .to_pkcs8_pem(LineEnding::LF)
            .expect("PKCS#8 encoding");
        Ok(Signer::from_pem(&pem)?.with_key_id("key-1"))
    }

    fn certs() -> anyhow::Result<StaticCerts> {
        let pem = RSA_KEY
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("SPKI encoding");
        Ok(StaticCerts::new([
            PublicKey::from_pem(&pem)?.with_key_id("key-1")
        ]))
    }

    #[derive(Debug)]
    struct ManualClock(Mutex<OffsetDateTime>);

    impl ManualClock {
        fn at(unix: i64) -> Arc<Self> {
            let now = OffsetDateTime::from_unix_timestamp(unix).expect("valid timestamp");
            Arc::new(Self(Mutex::new(now)))
        }

        fn set(&self, unix: i64) {
            *self.0.lock().unwrap() =
                OffsetDateTime::from_unix_timestamp(unix).expect("valid timestamp");
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> OffsetDateTime {
            *self.0.lock().unwrap()
        }
    }

    const IAT: i64 = 1_750_000_000;

    #[tokio::test]
    async fn round_trip() -> TestResult {
        let clock = ManualClock::at(IAT);
        let claims = ClaimsBuilder::new("issuer@example.com")
            .with_audience("https://service.example.com")
            .with_claim("custom", json!({"nested": [1, 2, 3]}))
            .build(clock.as_ref())?;
        let token = encode(&signer()?, &claims, None)?;
        assert_eq!(token.split('.').count(), 3, "{token}");

        let decoded = Decoder::new()
            .with_audience("https://service.example.com")
            .with_clock(clock.clone())
            .decode(&token, &certs()?)
            .await?;
        assert_eq!(decoded, claims);
        Ok(())
    }

    #[tokio::test]
    async fn tampered_signature() -> TestResult {
        let clock = ManualClock::at(IAT);
        let claims = ClaimsBuilder::new("issuer@example.com").build(clock.as_ref())?;
        let token = encode(&signer()?, &claims, None)?;

        let (message, signature) = token.rsplit_once('.').expect("three segments");
        let mut bytes = BASE64_URL_SAFE_NO_PAD.decode(signature)?;
        bytes[0] ^= 0x01;
        let tampered = format!("{message}.{}", BASE64_URL_SAFE_NO_PAD.encode(bytes));

        let err = Decoder::new()
            .with_clock(clock.clone())
            .decode(&tampered, &certs()?)
            .await
            .unwrap_err();
        assert!(err.is_signature(), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn tampered_claims() -> TestResult {
        let clock = ManualClock::at(IAT);
        let claims = ClaimsBuilder::new("issuer@example.com").build(clock.as_ref())?;
        let token = encode(&signer()?, &claims, None)?;

        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        let forged = json!({"iss": "someone-else@example.com", "iat": IAT, "exp": IAT + 3600});
        parts[1] = BASE64_URL_SAFE_NO_PAD.encode(forged.to_string());
        let err = Decoder::new()
            .with_clock(clock.clone())
            .decode(&parts.join("."), &certs()?)
            .await
            .unwrap_err();
        assert!(err.is_signature(), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn expiration_boundary_is_inclusive() -> TestResult {
        let clock = ManualClock::at(IAT);
        let claims = ClaimsBuilder::new("issuer@example.com")
            .with_lifetime(Duration::from_secs(3600))
            .build(clock.as_ref())?;
        let token = encode(&signer()?, &claims, None)?;
        let decoder = Decoder::new()
            .with_leeway(Duration::from_secs(10))
            .with_clock(clock.clone());

        // exp + leeway is still valid.
        clock.set(IAT + 3600 + 10);
        decoder.decode(&token, &certs()?).await?;

        clock.set(IAT + 3600 + 11);
        let err = decoder.decode(&token, &certs()?).await.unwrap_err();
        assert!(err.is_expired(), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn used_too_early() -> TestResult {
        let clock = ManualClock::at(IAT);
        let claims = ClaimsBuilder::new("issuer@example.com").build(clock.as_ref())?;
        let token = encode(&signer()?, &claims, None)?;
        let decoder = Decoder::new().with_clock(clock.clone());

        clock.set(IAT - 10);
        decoder.decode(&token, &certs()?).await?;

        clock.set(IAT - 11);
        let err = decoder.decode(&token, &certs()?).await.unwrap_err();
        assert!(err.is_too_early(), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn wrong_audience() -> TestResult {
        let clock = ManualClock::at(IAT);
        let claims = ClaimsBuilder::new("issuer@example.com")
            .with_audience("https://a.example.com")
            .build(clock.as_ref())?;
        let token = encode(&signer()?, &claims, None)?;
        let err = Decoder::new()
            .with_audience("https://b.example.com")
            .with_clock(clock.clone())
            .decode(&token, &certs()?)
            .await
            .unwrap_err();
        assert!(err.is_audience(), "{err:?}");
        Ok(())
    }
}
