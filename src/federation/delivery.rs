//! Activity delivery
//!
//! Signs and sends one queued activity to its target.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use http::{HeaderMap, HeaderName, HeaderValue};

use super::registry::SigningKeyStore;
use super::signature::{generate_digest, sign_request};
use super::transport::{HttpTransport, TransportRequest, TransportResponse};
use crate::data::QueueItem;
use crate::error::AppError;

/// Activity delivery service
///
/// Looks up the author's signing key, signs `(request-target) host date` for
/// the row's target and POSTs the stored payload.
#[derive(Clone)]
pub struct ActivityDelivery {
    transport: HttpTransport,
    signing_keys: Arc<dyn SigningKeyStore>,
}

fn header_value(value: &str) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(value)
        .map_err(|e| AppError::Validation(format!("Invalid header value: {}", e)))
}

impl ActivityDelivery {
    pub fn new(transport: HttpTransport, signing_keys: Arc<dyn SigningKeyStore>) -> Self {
        Self {
            transport,
            signing_keys,
        }
    }

    /// Build the signed header set for a queue row.
    ///
    /// # Errors
    /// `AppError::KeyUnavailable` when the author has no usable private key.
    pub async fn signed_headers(&self, item: &QueueItem) -> Result<HeaderMap, AppError> {
        let private_key_pem = self
            .signing_keys
            .get_private_key(&item.author)
            .await?
            .ok_or_else(|| {
                AppError::KeyUnavailable(format!("No private key for {}", item.author))
            })?;

        let signed = sign_request(
            &private_key_pem,
            &item.author,
            "POST",
            &item.instance.path,
            &item.instance.address,
            Utc::now(),
        )?;

        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, header_value(&signed.host)?);
        headers.insert(http::header::DATE, header_value(&signed.date)?);
        headers.insert(
            HeaderName::from_static("signature"),
            header_value(&signed.signature)?,
        );
        headers.insert(
            HeaderName::from_static("digest"),
            header_value(&generate_digest(item.activity.as_bytes()))?,
        );
        Ok(headers)
    }

    /// Deliver a queue row
    ///
    /// # Arguments
    /// * `item` - Row to deliver; must already be claimed
    /// * `timeout` - Shorter timeout for fast-path attempts
    ///
    /// # Errors
    /// Signing failures, transport failures and `PermanentlyGone` for a 410.
    /// Other non-2xx statuses come back as `Ok` with the status code.
    pub async fn deliver(
        &self,
        item: &QueueItem,
        timeout: Option<Duration>,
    ) -> Result<TransportResponse, AppError> {
        let headers = self.signed_headers(item).await?;

        let response = self
            .transport
            .send(TransportRequest {
                method: http::Method::POST,
                target: item.instance.clone(),
                headers,
                body: Some(item.activity.clone().into_bytes()),
                timeout,
            })
            .await?;

        tracing::debug!(
            item_id = item.id,
            address = %item.instance.address,
            status = response.code,
            "Delivery attempt answered"
        );
        if response.is_gone() {
            return Err(AppError::PermanentlyGone);
        }
        Ok(response)
    }
}
