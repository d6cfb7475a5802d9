//! LFS batch API types and handlers (`POST /{repo}/info/lfs/objects/batch`)
//! plus the plain content endpoints the returned hrefs point at. Payload
//! keys are content-addressable (sha256 oid, two-level fan-out).

use serde::{Deserialize, Serialize};

use crate::storage::{bucket::BucketStore, lfs::lfs_key};

pub const DEFAULT_EXPIRES_IN: u64 = 3600;

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub operation: String,
    #[serde(default)]
    pub transfers: Vec<String>,
    pub objects: Vec<BatchObjectRef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchObjectRef {
    pub oid: String,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub transfer: &'static str,
    pub objects: Vec<BatchObjectResponse>,
}

#[derive(Debug, Serialize)]
pub struct BatchObjectResponse {
    pub oid: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<ObjectActions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ObjectError>,
}

#[derive(Debug, Serialize)]
pub struct ObjectActions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<Action>,
}

#[derive(Debug, Serialize)]
pub struct Action {
    pub href: String,
    pub expires_in: u64,
}

#[derive(Debug, Serialize)]
pub struct ObjectError {
    pub code: u16,
    pub message: String,
}

fn valid_oid(oid: &str) -> bool {
    oid.len() == 64 && oid.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn object_href(external_base: &str, repo: &str, oid: &str) -> String {
    format!("{external_base}/{repo}/info/lfs/objects/{oid}")
}

/// Answer one batch request against the bucket. `repo_prefix` keys the
/// bucket; `repo` and `external_base` shape the returned hrefs.
pub async fn batch(
    bucket: &dyn BucketStore,
    repo_prefix: &str,
    repo: &str,
    external_base: &str,
    request: &BatchRequest,
) -> Result<BatchResponse, crate::errors::GitError> {
    let download = match request.operation.as_str() {
        "download" => true,
        "upload" => false,
        other => {
            return Err(crate::errors::GitError::Conversion(format!(
                "unknown LFS operation `{other}`"
            )));
        }
    };

    let mut objects = Vec::with_capacity(request.objects.len());
    for obj in &request.objects {
        if !valid_oid(&obj.oid) {
            objects.push(BatchObjectResponse {
                oid: obj.oid.clone(),
                size: obj.size,
                authenticated: None,
                actions: None,
                error: Some(ObjectError {
                    code: 422,
                    message: "oid is not 64 lowercase hex characters".to_string(),
                }),
            });
            continue;
        }
        let present = bucket.head(&lfs_key(repo_prefix, &obj.oid)).await?;
        let response = if download {
            if present {
                BatchObjectResponse {
                    oid: obj.oid.clone(),
                    size: obj.size,
                    authenticated: Some(true),
                    actions: Some(ObjectActions {
                        download: Some(Action {
                            href: object_href(external_base, repo, &obj.oid),
                            expires_in: DEFAULT_EXPIRES_IN,
                        }),
                        upload: None,
                    }),
                    error: None,
                }
            } else {
                BatchObjectResponse {
                    oid: obj.oid.clone(),
                    size: obj.size,
                    authenticated: None,
                    actions: None,
                    error: Some(ObjectError {
                        code: 404,
                        message: "object does not exist".to_string(),
                    }),
                }
            }
        } else if present {
            // Content-addressable dedup: nothing to upload.
            BatchObjectResponse {
                oid: obj.oid.clone(),
                size: obj.size,
                authenticated: Some(true),
                actions: None,
                error: None,
            }
        } else {
            BatchObjectResponse {
                oid: obj.oid.clone(),
                size: obj.size,
                authenticated: Some(true),
                actions: Some(ObjectActions {
                    download: None,
                    upload: Some(Action {
                        href: object_href(external_base, repo, &obj.oid),
                        expires_in: DEFAULT_EXPIRES_IN,
                    }),
                }),
                error: None,
            }
        };
        objects.push(response);
    }
    Ok(BatchResponse {
        transfer: "basic",
        objects,
    })
}
