//! Generic CRUD service over one resource collection, plus the concurrent
//! "list everything" pagination fan-out.

use futures_util::future::try_join_all;
use indexmap::IndexMap;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::client::{ApiRequest, Client};
use crate::context::Context;
use crate::error::{Result, ScmError};

/// Largest page the API hands out
pub const MAX_PAGE_SIZE: i64 = 2000;

/// `limit` value asking for every item
pub const LIMIT_ALL: i64 = -1;

/// Times the fan-out restarts when the collection changes under it
pub const MAX_LIST_RETRIES: usize = 5;

/// Most concurrent page requests one fan-out will issue
pub const MAX_FAN_OUT_PAGES: i64 = 500;

/// Pages needed to cover `total` items; `None` past [`MAX_FAN_OUT_PAGES`]
fn page_count(total: i64) -> Option<i64> {
    let pages = total / MAX_PAGE_SIZE + i64::from(total % MAX_PAGE_SIZE != 0);
    (pages <= MAX_FAN_OUT_PAGES).then_some(pages)
}

/// A configuration object type served under a fixed path
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Module used to pick the host path prefix
    const MODULE: &'static str;
    /// Collection path, e.g. `/addresses`
    const PATH: &'static str;

    fn id(&self) -> Option<&str>;
}

/// Rulebase selector for policy collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Pre,
    Post,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Pre => f.write_str("pre"),
            Position::Post => f.write_str("post"),
        }
    }
}

/// Container an object is created in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Folder(String),
    Snippet(String),
    Device(String),
}

impl Location {
    fn apply(&self, request: ApiRequest) -> ApiRequest {
        match self {
            Location::Folder(name) => request.query("folder", name),
            Location::Snippet(name) => request.query("snippet", name),
            Location::Device(name) => request.query("device", name),
        }
    }
}

/// Filters and paging for a list call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListInput {
    pub folder: Option<String>,
    pub snippet: Option<String>,
    pub device: Option<String>,
    pub name: Option<String>,
    /// Page size (server default 200, max 2000); [`LIMIT_ALL`] for everything
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub position: Option<Position>,
}

impl ListInput {
    pub fn folder(name: impl Into<String>) -> Self {
        ListInput {
            folder: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    fn page(&self, limit: i64, offset: i64) -> Self {
        ListInput {
            limit: Some(limit),
            offset: Some(offset),
            ..self.clone()
        }
    }
}

/// One page of a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListOutput<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub total: i64,
}

/// CRUD client for resource `T`
pub struct Service<T> {
    client: Arc<Client>,
    _resource: PhantomData<fn() -> T>,
}

impl<T> Clone for Service<T> {
    fn clone(&self) -> Self {
        Service {
            client: self.client.clone(),
            _resource: PhantomData,
        }
    }
}

impl<T: Resource> Service<T> {
    pub fn new(client: Arc<Client>) -> Self {
        Service {
            client,
            _resource: PhantomData,
        }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    fn item_path(id: &str) -> String {
        format!("{}/{}", T::PATH.trim_end_matches('/'), id)
    }

    /// List one page, or everything when `limit` is [`LIMIT_ALL`]
    pub async fn list(&self, ctx: &Context, input: &ListInput) -> Result<ListOutput<T>> {
        if input.limit == Some(LIMIT_ALL) {
            return self.list_all(ctx, input).await;
        }
        self.list_page(ctx, input).await
    }

    async fn list_page(&self, ctx: &Context, input: &ListInput) -> Result<ListOutput<T>> {
        let request = ApiRequest::get(T::MODULE, T::PATH)
            .query_opt("folder", input.folder.as_ref())
            .query_opt("snippet", input.snippet.as_ref())
            .query_opt("device", input.device.as_ref())
            .query_opt("name", input.name.as_ref())
            .query_opt("limit", input.limit)
            .query_opt("offset", input.offset)
            .query_opt("position", input.position);
        self.client.execute_json(ctx, &request).await
    }

    /// Fetch the whole collection with concurrent page requests.
    ///
    /// A probe at the maximum page size learns the total, then one request
    /// per page runs concurrently. If any page reports a different total the
    /// collection changed mid-scan and the whole scan starts over, at most
    /// [`MAX_LIST_RETRIES`] times.
    pub async fn list_all(&self, ctx: &Context, input: &ListInput) -> Result<ListOutput<T>> {
        for round in 0..MAX_LIST_RETRIES {
            let probe = self.list_page(ctx, &input.page(MAX_PAGE_SIZE, 0)).await?;
            let total = probe.total;
            if total <= 0 {
                return Ok(ListOutput {
                    data: Vec::new(),
                    limit: 0,
                    offset: 0,
                    total: 0,
                });
            }

            let pages = page_count(total).ok_or_else(|| {
                ScmError::Other(format!(
                    "list of {} reports {} items, more than {} pages of {}",
                    T::PATH,
                    total,
                    MAX_FAN_OUT_PAGES,
                    MAX_PAGE_SIZE
                ))
            })?;
            debug!(
                "resource.list_all path={} total={} pages={} round={}",
                T::PATH,
                total,
                pages,
                round
            );
            let requests = (0..pages).map(|page| {
                let page_input = input.page(MAX_PAGE_SIZE, page * MAX_PAGE_SIZE);
                async move { self.list_page(ctx, &page_input).await }
            });
            let results = try_join_all(requests).await?;

            if let Some(changed) = results.iter().find(|p| p.total != total) {
                warn!(
                    "resource.list_all total changed during scan path={} before={} after={}",
                    T::PATH,
                    total,
                    changed.total
                );
                continue;
            }

            let mut items: IndexMap<String, T> = IndexMap::new();
            let mut anonymous = Vec::new();
            for item in results.into_iter().flat_map(|p| p.data) {
                match item.id() {
                    Some(id) => {
                        let id = id.to_string();
                        items.entry(id).or_insert(item);
                    }
                    None => anonymous.push(item),
                }
            }

            let mut data: Vec<T> = items.into_values().collect();
            data.extend(anonymous);
            return Ok(ListOutput {
                limit: data.len() as i64,
                offset: 0,
                total: data.len() as i64,
                data,
            });
        }

        Err(ScmError::TooManyRetries {
            attempts: MAX_LIST_RETRIES,
        })
    }

    pub async fn get(&self, ctx: &Context, id: &str) -> Result<T> {
        let request = ApiRequest::get(T::MODULE, Self::item_path(id));
        self.client.execute_json(ctx, &request).await
    }

    pub async fn create(&self, ctx: &Context, location: &Location, item: &T) -> Result<T> {
        let request = location.apply(ApiRequest::post(T::MODULE, T::PATH)).json(item)?;
        self.client.execute_json(ctx, &request).await
    }

    pub async fn update(&self, ctx: &Context, id: &str, item: &T) -> Result<T> {
        let request = ApiRequest::put(T::MODULE, Self::item_path(id)).json(item)?;
        self.client.execute_json(ctx, &request).await
    }

    pub async fn delete(&self, ctx: &Context, id: &str) -> Result<()> {
        let request = ApiRequest::delete(T::MODULE, Self::item_path(id));
        self.client.execute(ctx, &request).await?;
        Ok(())
    }
}
