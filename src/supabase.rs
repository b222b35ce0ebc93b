use crate::http::build_client;
use crate::intake::codec::EncodedBytes;
use crate::intake::draft::{CarRecord, ListingSubmission};
use crate::store::{ListingStore, SavedCarStore, StoreError, StoredListing};
use chrono::Utc;
use futures::{FutureExt, future::BoxFuture};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use urlencoding::encode;
use uuid::Uuid;

const DEFAULT_BUCKET: &str = "car-images";

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    bucket: String,
    http: Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CarRow<'a> {
    id: &'a str,
    #[serde(flatten)]
    car: &'a CarRecord,
    images: &'a [String],
}

/// Body of the storage bulk delete.
#[derive(Debug, Serialize)]
struct RemoveObjects<'a> {
    prefixes: &'a [String],
}

#[derive(Debug, Deserialize)]
struct InsertedCar {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SavedRow {
    #[allow(dead_code)]
    car_id: String,
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        let bucket = std::env::var("SUPABASE_IMAGE_BUCKET")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BUCKET.to_string());
        Some(Self::new(base_url, service_key, bucket))
    }

    pub fn new(base_url: String, service_key: String, bucket: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            bucket,
            http: build_client(),
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, path
        )
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, path)
    }

    /// Uploads one data URI and returns its object path inside the bucket.
    async fn upload_image(
        &self,
        folder: &str,
        position: usize,
        data_uri: &str,
    ) -> Result<String, StoreError> {
        let image = EncodedBytes::from_data_uri(data_uri)
            .map_err(|err| StoreError::Rejected(err.to_string()))?;
        let bytes = image
            .decode()
            .map_err(|err| StoreError::Rejected(err.to_string()))?;
        let extension = image
            .media_type()
            .rsplit('/')
            .next()
            .filter(|ext| !ext.is_empty())
            .unwrap_or("jpeg");
        let path = format!(
            "{folder}/image-{}-{position}.{extension}",
            Utc::now().timestamp_millis()
        );

        let response = self
            .authorized(self.http.post(self.object_url(&path)))
            .header("Content-Type", image.media_type())
            .body(bytes)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Request(format!(
                "image upload HTTP {}",
                response.status()
            )));
        }
        Ok(path)
    }

    /// Best effort: deletes objects uploaded for a listing that was never
    /// stored. Paths that could not be removed are logged.
    async fn discard_uploads(&self, paths: &[String]) {
        if paths.is_empty() {
            return;
        }
        let outcome = self
            .authorized(
                self.http
                    .delete(format!("{}/storage/v1/object/{}", self.base_url, self.bucket)),
            )
            .json(&RemoveObjects { prefixes: paths })
            .send()
            .await;
        match outcome {
            Ok(response) if response.status().is_success() => {
                info!(target = "intake.store", removed = paths.len(), "orphan_images_removed");
            }
            Ok(response) => {
                warn!(target = "intake.store", status = %response.status(), ?paths, "orphan_images_left");
            }
            Err(err) => {
                warn!(target = "intake.store", error = %err, ?paths, "orphan_images_left");
            }
        }
    }

    pub async fn insert_car(
        &self,
        submission: &ListingSubmission,
    ) -> Result<StoredListing, StoreError> {
        let car_id = Uuid::new_v4().to_string();
        let folder = format!("cars/{car_id}");

        if submission.images.is_empty() {
            return Err(StoreError::Rejected("no valid images".into()));
        }
        let mut paths = Vec::with_capacity(submission.images.len());
        for (position, data_uri) in submission.images.iter().enumerate() {
            match self.upload_image(&folder, position, data_uri).await {
                Ok(path) => paths.push(path),
                Err(err) => {
                    self.discard_uploads(&paths).await;
                    return Err(err);
                }
            }
        }
        let image_urls: Vec<String> = paths.iter().map(|path| self.public_url(path)).collect();

        match self.insert_row(&car_id, submission, &image_urls).await {
            Ok(id) => {
                info!(target = "intake.store", car_id = %id, images = image_urls.len(), "car_inserted");
                Ok(StoredListing {
                    id,
                    image_urls,
                    created_at: Utc::now(),
                })
            }
            Err(err) => {
                self.discard_uploads(&paths).await;
                Err(err)
            }
        }
    }

    async fn insert_row(
        &self,
        car_id: &str,
        submission: &ListingSubmission,
        image_urls: &[String],
    ) -> Result<String, StoreError> {
        let row = CarRow {
            id: car_id,
            car: &submission.car,
            images: image_urls,
        };
        let response = self
            .authorized(self.http.post(format!("{}/rest/v1/cars", self.base_url)))
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;

        if !response.status().is_success() {
            warn!(target = "intake.store", car_id = %car_id, status = %response.status(), "car_insert_failed");
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }

        // the row exists at this point, so an unreadable body keeps our id
        let mut inserted: Vec<InsertedCar> = match response.json().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(target = "intake.store", car_id = %car_id, error = %err, "car_insert_response_unreadable");
                Vec::new()
            }
        };
        Ok(inserted
            .pop()
            .map(|row| row.id)
            .unwrap_or_else(|| car_id.to_string()))
    }

    fn saved_filter(&self, user_id: &str, car_id: &str) -> String {
        format!(
            "{}/rest/v1/user_saved_cars?user_id=eq.{}&car_id=eq.{}",
            self.base_url,
            encode(user_id),
            encode(car_id)
        )
    }

    pub async fn toggle_saved_car(&self, user_id: &str, car_id: &str) -> Result<bool, StoreError> {
        let filter = self.saved_filter(user_id, car_id);
        let response = self
            .authorized(self.http.get(format!("{filter}&select=car_id&limit=1")))
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        let existing: Vec<SavedRow> = response
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;

        let (request, saved) = if existing.is_empty() {
            let body = serde_json::json!({ "user_id": user_id, "car_id": car_id });
            (
                self.http
                    .post(format!("{}/rest/v1/user_saved_cars", self.base_url))
                    .json(&body),
                true,
            )
        } else {
            (self.http.delete(filter), false)
        };

        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        Ok(saved)
    }
}

impl ListingStore for SupabaseClient {
    fn add_car(
        &self,
        submission: ListingSubmission,
    ) -> BoxFuture<'_, Result<StoredListing, StoreError>> {
        async move { self.insert_car(&submission).await }.boxed()
    }
}

impl SavedCarStore for SupabaseClient {
    fn toggle_saved<'a>(
        &'a self,
        user_id: &'a str,
        car_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        self.toggle_saved_car(user_id, car_id).boxed()
    }
}
