//! A `reqwest`-backed [`VectorStoreClient`]/[`Collection`] implementation
//! against a Chroma-compatible HTTP API (§6's `HTTP {host,port,ssl,headers}`
//! and `Cloud {tenant,database,api_key,host,port,ssl}` client constructors).

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use vecdex_core::vector_store::{
    parse_duplicate_ids, Collection, GetRequest, GetResult, Metadata, QueryRequest, QueryResult,
    UpsertError, VectorStoreClient,
};

use crate::query_client::StoreAddress;

trait StoreAddressUrl {
    fn base_url(&self) -> String;
    fn tenant(&self) -> &str;
    fn database(&self) -> &str;
    fn collections_url(&self) -> String;
}

impl StoreAddressUrl for StoreAddress {
    fn base_url(&self) -> String {
        let (host, port, ssl) = match self {
            StoreAddress::Http { host, port, ssl, .. } => (host, *port, *ssl),
            StoreAddress::Cloud { host, port, ssl, .. } => (host, *port, *ssl),
        };
        format!("{}://{host}:{port}/api/v1", if ssl { "https" } else { "http" })
    }

    fn tenant(&self) -> &str {
        match self {
            StoreAddress::Http { .. } => "default_tenant",
            StoreAddress::Cloud { tenant, .. } => tenant,
        }
    }

    fn database(&self) -> &str {
        match self {
            StoreAddress::Http { .. } => "default_database",
            StoreAddress::Cloud { database, .. } => database,
        }
    }

    fn collections_url(&self) -> String {
        format!(
            "{}/tenants/{}/databases/{}/collections",
            self.base_url(),
            self.tenant(),
            self.database()
        )
    }
}

/// Resolves collection handles against a single Chroma-compatible endpoint.
/// One client per run; [`Self::get_or_create_collection`] is called once per
/// collection name and the returned handle is cached by the caller (the fan-
/// out query client and the batch indexer both do their own caching).
pub struct HttpVectorStoreClient {
    client: Client,
    address: StoreAddress,
}

impl HttpVectorStoreClient {
    pub fn new(address: StoreAddress) -> anyhow::Result<Self> {
        let mut header_map = header::HeaderMap::new();
        match &address {
            StoreAddress::Http { headers, .. } => {
                for (key, value) in headers {
                    header_map.insert(
                        header::HeaderName::from_bytes(key.as_bytes())?,
                        header::HeaderValue::from_str(value)?,
                    );
                }
            }
            StoreAddress::Cloud { api_key, .. } => {
                header_map.insert("x-chroma-token", header::HeaderValue::from_str(api_key)?);
            }
        }
        let client = Client::builder().default_headers(header_map).build()?;
        Ok(Self { client, address })
    }
}

#[async_trait]
impl VectorStoreClient for HttpVectorStoreClient {
    async fn get_or_create_collection(&self, name: &str) -> anyhow::Result<Arc<dyn Collection>> {
        #[derive(Serialize)]
        struct CreateRequest<'a> {
            name: &'a str,
            get_or_create: bool,
        }
        #[derive(Deserialize)]
        struct CreateResponse {
            id: String,
        }

        let body: CreateResponse = self
            .client
            .post(self.address.collections_url())
            .json(&CreateRequest { name, get_or_create: true })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(Arc::new(HttpCollection {
            client: self.client.clone(),
            collection_url: format!("{}/{}", self.address.collections_url(), body.id),
            name: name.to_string(),
        }))
    }
}

struct HttpCollection {
    client: Client,
    collection_url: String,
    name: String,
}

#[async_trait]
impl Collection for HttpCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, ids: Vec<String>, documents: Vec<String>, metadatas: Vec<Metadata>) -> Result<(), UpsertError> {
        #[derive(Serialize)]
        struct UpsertBody {
            ids: Vec<String>,
            documents: Vec<String>,
            metadatas: Vec<Metadata>,
        }

        let response = self
            .client
            .post(format!("{}/upsert", self.collection_url))
            .json(&UpsertBody { ids, documents, metadatas })
            .send()
            .await
            .map_err(|e| UpsertError::Other(e.into()))?;

        if response.status() == StatusCode::CONFLICT {
            let body = response.text().await.unwrap_or_default();
            let dup_ids = parse_duplicate_ids(&body);
            return if dup_ids.is_empty() {
                Err(UpsertError::Other(anyhow::anyhow!("upsert conflict: {body}")))
            } else {
                Err(UpsertError::DuplicateId { ids: dup_ids })
            };
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(UpsertError::Other(anyhow::anyhow!("upsert failed ({status}): {body}")));
        }
        Ok(())
    }

    async fn get(&self, request: GetRequest) -> anyhow::Result<GetResult> {
        #[derive(Serialize)]
        struct GetBody {
            #[serde(skip_serializing_if = "Option::is_none")]
            ids: Option<Vec<String>>,
            #[serde(skip_serializing_if = "Option::is_none")]
            r#where: Option<serde_json::Value>,
            #[serde(skip_serializing_if = "Option::is_none")]
            where_document: Option<serde_json::Value>,
            #[serde(skip_serializing_if = "Option::is_none")]
            limit: Option<usize>,
            #[serde(skip_serializing_if = "Option::is_none")]
            offset: Option<usize>,
            #[serde(skip_serializing_if = "Option::is_none")]
            include: Option<Vec<String>>,
        }
        let body = GetBody {
            ids: request.ids,
            r#where: request.where_,
            where_document: request.where_document,
            limit: request.limit,
            offset: request.offset,
            include: request.include,
        };
        let result = self
            .client
            .post(format!("{}/get", self.collection_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(result)
    }

    async fn query(&self, request: QueryRequest) -> anyhow::Result<QueryResult> {
        #[derive(Serialize)]
        struct QueryBody {
            #[serde(skip_serializing_if = "Option::is_none")]
            query_embeddings: Option<Vec<Vec<f32>>>,
            #[serde(skip_serializing_if = "Option::is_none")]
            query_texts: Option<Vec<String>>,
            n_results: usize,
            #[serde(skip_serializing_if = "Option::is_none")]
            r#where: Option<serde_json::Value>,
            #[serde(skip_serializing_if = "Option::is_none")]
            where_document: Option<serde_json::Value>,
            #[serde(skip_serializing_if = "Option::is_none")]
            include: Option<Vec<String>>,
        }
        let body = QueryBody {
            query_embeddings: request.query_embeddings,
            query_texts: request.query_texts,
            n_results: request.n_results,
            r#where: request.where_,
            where_document: request.where_document,
            include: request.include,
        };
        let result = self
            .client
            .post(format!("{}/query", self.collection_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(result)
    }

    async fn count(&self) -> anyhow::Result<u64> {
        let count = self
            .client
            .get(format!("{}/count", self.collection_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn http_address_defaults_to_default_tenant_and_database() {
        let address = StoreAddress::Http {
            host: "localhost".to_string(),
            port: 8000,
            ssl: false,
            headers: HashMap::new(),
        };
        assert_eq!(address.base_url(), "http://localhost:8000/api/v1");
        assert_eq!(
            address.collections_url(),
            "http://localhost:8000/api/v1/tenants/default_tenant/databases/default_database/collections"
        );
    }

    #[test]
    fn cloud_address_uses_ssl_and_configured_tenant() {
        let address = StoreAddress::Cloud {
            tenant: "acme".to_string(),
            database: "prod".to_string(),
            api_key: "secret".to_string(),
            host: "api.trychroma.com".to_string(),
            port: 443,
            ssl: true,
        };
        assert_eq!(address.base_url(), "https://api.trychroma.com:443/api/v1");
        assert_eq!(
            address.collections_url(),
            "https://api.trychroma.com:443/api/v1/tenants/acme/databases/prod/collections"
        );
    }
}
