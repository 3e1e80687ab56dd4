use std::sync::Arc;

use async_trait::async_trait;
use rearch::CapsuleHandle;
use thiserror::Error;
use tracing::{instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    short_code::{RandomSourceError, ShortCode},
    url_repo::{NewUrlMapping, StoreError, UrlMapping, UrlRepository, url_repository_capsule},
};

/// Total create attempts per shorten request before giving up on allocating a code.
pub const SHORTEN_ATTEMPTS: usize = 5;

pub fn url_service_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Arc<dyn UrlService> {
    url_service(Arc::clone(get.as_ref(url_repository_capsule)))
}

#[must_use]
pub fn url_service(url_repo: Arc<dyn UrlRepository>) -> Arc<dyn UrlService> {
    Arc::new(UrlServiceImpl { url_repo })
}

#[async_trait]
pub trait UrlService: Send + Sync {
    async fn shorten(&self, original_url: &str) -> Result<UrlMapping, ShortenError>;
    async fn resolve(&self, code: &str) -> Result<UrlMapping, ResolveError>;
    async fn delete(&self, id: Uuid) -> Result<(), DeleteError>;
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum InvalidUrlError {
    #[error(transparent)]
    Parse(#[from] url::ParseError),
    #[error("URL must not contain control characters or surrounding whitespace")]
    ControlCharacters,
}

#[derive(Debug, Error)]
pub enum ShortenError {
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] InvalidUrlError),
    #[error("no free short code found after {attempts} attempts")]
    CodeAllocationExhausted { attempts: usize },
    #[error(transparent)]
    RandomSource(#[from] RandomSourceError),
    #[error("store error: {0}")]
    Store(StoreError), // NOTE: no #[from] so DuplicateCode can't slip through by accident
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("short code not found")]
    NotFound,
    #[error("store error: {0}")]
    Store(StoreError),
}

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("mapping not found")]
    NotFound,
    #[error("store error: {0}")]
    Store(StoreError),
}

struct UrlServiceImpl {
    url_repo: Arc<dyn UrlRepository>,
}

/// Checks `original_url` and returns the form to store and redirect to.
///
/// Plain printable ASCII is kept byte for byte. Anything else (interior spaces,
/// non-ASCII hosts or paths) is replaced by its serialized, percent-encoded form.
fn validate_url(original_url: &str) -> Result<String, InvalidUrlError> {
    // NOTE: Url::parse silently strips these, so they would survive into the stored URL
    if original_url.chars().any(char::is_control) || original_url.trim() != original_url {
        return Err(InvalidUrlError::ControlCharacters);
    }
    let parsed = Url::parse(original_url)?;
    if original_url.bytes().all(|b| b.is_ascii_graphic()) {
        Ok(original_url.to_owned())
    } else {
        Ok(parsed.into())
    }
}

#[async_trait]
impl UrlService for UrlServiceImpl {
    #[instrument(skip(self))]
    async fn shorten(&self, original_url: &str) -> Result<UrlMapping, ShortenError> {
        let original_url = validate_url(original_url)?;

        for attempt in 1..=SHORTEN_ATTEMPTS {
            let code = ShortCode::generate()?;
            let to_create = NewUrlMapping {
                code: code.clone(),
                original_url: original_url.clone(),
            };

            match self.url_repo.create(to_create).await {
                Ok(mapping) => return Ok(mapping),
                Err(StoreError::DuplicateCode) => {
                    warn!(attempt, %code, "Generated short code was already taken");
                }
                Err(err) => return Err(ShortenError::Store(err)),
            }
        }

        Err(ShortenError::CodeAllocationExhausted {
            attempts: SHORTEN_ATTEMPTS,
        })
    }

    #[instrument(skip(self))]
    async fn resolve(&self, code: &str) -> Result<UrlMapping, ResolveError> {
        // NOTE: a malformed code can never have been issued, so skip the store
        let Ok(code) = ShortCode::new(code.to_owned()) else {
            return Err(ResolveError::NotFound);
        };

        match self.url_repo.get_by_code(&code).await {
            Ok(mapping) => Ok(mapping),
            Err(StoreError::NotFound) => Err(ResolveError::NotFound),
            Err(err) => Err(ResolveError::Store(err)),
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<(), DeleteError> {
        match self.url_repo.delete(id).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound) => Err(DeleteError::NotFound),
            Err(err) => Err(DeleteError::Store(err)),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.url_repo.ping().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use mockall::{mock, predicate::*};
    use time::OffsetDateTime;

    use crate::{memory_repo::InMemoryUrlRepository, short_code::CODE_LENGTH};

    use super::*;

    mock! {
        UrlRepository {}

        #[async_trait]
        impl UrlRepository for UrlRepository {
            async fn create(&self, mapping: NewUrlMapping) -> Result<UrlMapping, StoreError>;
            async fn get_by_code(&self, code: &ShortCode) -> Result<UrlMapping, StoreError>;
            async fn get_by_id(&self, id: Uuid) -> Result<UrlMapping, StoreError>;
            async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
            async fn ping(&self) -> Result<(), StoreError>;
        }
    }

    fn persisted(mapping: NewUrlMapping) -> UrlMapping {
        let now = OffsetDateTime::now_utc();
        UrlMapping {
            id: Uuid::new_v4(),
            code: mapping.code,
            original_url: mapping.original_url,
            created_at: now,
            updated_at: now,
        }
    }

    fn service(url_repo: impl UrlRepository + 'static) -> UrlServiceImpl {
        UrlServiceImpl {
            url_repo: Arc::new(url_repo),
        }
    }

    #[tokio::test]
    async fn test_shorten_success() {
        let long_url = "https://example.com";
        let mut mock_repo = MockUrlRepository::new();
        mock_repo
            .expect_create()
            .withf(move |mapping| {
                mapping.original_url == long_url && mapping.code.as_str().len() == CODE_LENGTH
            })
            .once()
            .returning(|mapping| Ok(persisted(mapping)));

        let result = service(mock_repo).shorten(long_url).await.unwrap();
        assert_eq!(result.original_url, long_url);
        assert_eq!(result.code.as_str().len(), CODE_LENGTH);
    }

    #[tokio::test]
    async fn test_shorten_invalid_url_never_writes() {
        let mock_repo = MockUrlRepository::new();
        let service = service(mock_repo);

        for bad in ["not-a-valid-url", "", "/relative/path", "https://exa mple.com"] {
            let err = service.shorten(bad).await.unwrap_err();
            assert!(
                matches!(err, ShortenError::InvalidUrl(_)),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_shorten_rejects_embedded_newline() {
        let service = service(MockUrlRepository::new());
        let err = service
            .shorten("https://example.com/\nSet-Cookie: a=b")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShortenError::InvalidUrl(InvalidUrlError::ControlCharacters)
        ));
    }

    #[tokio::test]
    async fn test_shorten_rejects_stripped_characters() {
        let service = service(MockUrlRepository::new());
        for bad in [
            " https://example.com",
            "https://example.com/ ",
            "https://example.com/\tpath",
            "https://example.com/\r",
            "https://example.com/\u{7f}",
        ] {
            assert!(
                matches!(
                    service.shorten(bad).await.unwrap_err(),
                    ShortenError::InvalidUrl(InvalidUrlError::ControlCharacters)
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_url_keeps_printable_ascii_verbatim() {
        for url in [
            "https://example.com",
            "HTTPS://Example.com/a/../b?x=%7e",
            "http://localhost:8080/a/b?c=d#e",
        ] {
            assert_eq!(validate_url(url).unwrap(), url);
        }
    }

    #[test]
    fn test_validate_url_encodes_spaces_and_non_ascii() {
        assert_eq!(
            validate_url("https://example.com/a b?q=x y").unwrap(),
            "https://example.com/a%20b?q=x%20y"
        );
        assert_eq!(
            validate_url("https://bücher.example/straße").unwrap(),
            "https://xn--bcher-kva.example/stra%C3%9Fe"
        );
    }

    #[tokio::test]
    async fn test_shorten_stores_encoded_form() {
        let mut mock_repo = MockUrlRepository::new();
        mock_repo
            .expect_create()
            .withf(|mapping| mapping.original_url == "https://example.com/a%20b")
            .once()
            .returning(|mapping| Ok(persisted(mapping)));

        let result = service(mock_repo)
            .shorten("https://example.com/a b")
            .await
            .unwrap();
        assert_eq!(result.original_url, "https://example.com/a%20b");
    }

    #[tokio::test]
    async fn test_shorten_retries_on_duplicate_code() {
        let mut mock_repo = MockUrlRepository::new();
        let mut seq = mockall::Sequence::new();
        mock_repo
            .expect_create()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(StoreError::DuplicateCode));
        mock_repo
            .expect_create()
            .once()
            .in_sequence(&mut seq)
            .returning(|mapping| Ok(persisted(mapping)));

        let result = service(mock_repo)
            .shorten("https://example.com/retry")
            .await
            .unwrap();
        assert_eq!(result.original_url, "https://example.com/retry");
    }

    #[tokio::test]
    async fn test_shorten_exhausts_attempts() {
        let mut mock_repo = MockUrlRepository::new();
        mock_repo
            .expect_create()
            .times(SHORTEN_ATTEMPTS)
            .returning(|_| Err(StoreError::DuplicateCode));

        let err = service(mock_repo)
            .shorten("https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShortenError::CodeAllocationExhausted { attempts } if attempts == SHORTEN_ATTEMPTS
        ));
    }

    #[tokio::test]
    async fn test_shorten_store_unavailable_not_retried() {
        let mut mock_repo = MockUrlRepository::new();
        mock_repo
            .expect_create()
            .once()
            .returning(|_| Err(StoreError::Unavailable(anyhow::anyhow!("pool timed out"))));

        let err = service(mock_repo)
            .shorten("https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ShortenError::Store(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_resolve_success() {
        let mut mock_repo = MockUrlRepository::new();
        let code = ShortCode::new("abc1234".to_owned()).unwrap();
        let expected = persisted(NewUrlMapping {
            code: code.clone(),
            original_url: "https://example.com".to_owned(),
        });
        mock_repo
            .expect_get_by_code()
            .with(eq(code))
            .once()
            .return_once({
                let expected = expected.clone();
                move |_| Ok(expected)
            });

        let result = service(mock_repo).resolve("abc1234").await.unwrap();
        assert_eq!(result, expected);
    }

    #[tokio::test]
    async fn test_resolve_not_found() {
        let mut mock_repo = MockUrlRepository::new();
        mock_repo
            .expect_get_by_code()
            .once()
            .return_once(|_| Err(StoreError::NotFound));

        let err = service(mock_repo).resolve("missing").await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound));
    }

    #[tokio::test]
    async fn test_resolve_malformed_code_skips_store() {
        let service = service(MockUrlRepository::new());
        for bad in ["abc", "favicon.ico", "abcdefgh"] {
            assert!(matches!(
                service.resolve(bad).await.unwrap_err(),
                ResolveError::NotFound
            ));
        }
    }

    #[tokio::test]
    async fn test_resolve_store_error() {
        let mut mock_repo = MockUrlRepository::new();
        mock_repo
            .expect_get_by_code()
            .once()
            .return_once(|_| Err(StoreError::Internal(anyhow::anyhow!("test error"))));

        let err = service(mock_repo).resolve("abc1234").await.unwrap_err();
        assert!(matches!(err, ResolveError::Store(StoreError::Internal(_))));
    }

    #[tokio::test]
    async fn test_delete_success_and_not_found() {
        let id = Uuid::new_v4();
        let mut mock_repo = MockUrlRepository::new();
        let mut seq = mockall::Sequence::new();
        mock_repo
            .expect_delete()
            .with(eq(id))
            .once()
            .in_sequence(&mut seq)
            .return_once(|_| Ok(()));
        mock_repo
            .expect_delete()
            .with(eq(id))
            .once()
            .in_sequence(&mut seq)
            .return_once(|_| Err(StoreError::NotFound));

        let service = service(mock_repo);
        service.delete(id).await.unwrap();
        assert!(matches!(
            service.delete(id).await.unwrap_err(),
            DeleteError::NotFound
        ));
    }

    #[tokio::test]
    async fn test_shorten_resolve_delete_round_trip() {
        let repo = Arc::new(InMemoryUrlRepository::new());
        let service = url_service(Arc::clone(&repo) as Arc<dyn UrlRepository>);

        for long_url in [
            "https://example.com",
            "http://localhost:8080/a/b?c=d#e",
            "ftp://files.example.org/pub",
        ] {
            let created = service.shorten(long_url).await.unwrap();
            let resolved = service.resolve(created.code.as_str()).await.unwrap();
            assert_eq!(resolved.original_url, long_url);
            assert_eq!(resolved.id, created.id);

            service.delete(created.id).await.unwrap();
            assert!(matches!(
                service.resolve(created.code.as_str()).await.unwrap_err(),
                ResolveError::NotFound
            ));
            assert!(matches!(
                repo.get_by_id(created.id).await.unwrap_err(),
                StoreError::NotFound
            ));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_shorten_yields_unique_codes() {
        let repo = Arc::new(InMemoryUrlRepository::new());
        let service = url_service(Arc::clone(&repo) as Arc<dyn UrlRepository>);

        let handles: Vec<_> = (0..100)
            .map(|i| {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    service
                        .shorten(&format!("https://example.com/{i}"))
                        .await
                })
            })
            .collect();

        let mut codes = HashSet::new();
        for handle in handles {
            let mapping = handle.await.unwrap().unwrap();
            assert!(codes.insert(mapping.code.into_inner()));
        }
        assert_eq!(codes.len(), 100);
        assert_eq!(repo.len(), 100);
    }
}
