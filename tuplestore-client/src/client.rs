//! Client entry point and data-plane operations.

use std::sync::Arc;

use rmpv::Value;
use tokio::sync::broadcast;
use tracing::debug;

use tuplestore_core::protocol::request::RequestBody;
use tuplestore_core::protocol::response::Response;
use tuplestore_core::{IteratorType, Result, TupleStoreError};

use crate::config::ClientConfig;
use crate::connection::{ConnectionEvent, Transport};
use crate::schema::{IndexRef, SchemaCache, Space, SpaceDescriptor};
use crate::tuple::Tuple;
use crate::update::UpdateOp;

/// Options for a select: limit, offset, and iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectOptions {
    limit: u32,
    offset: u32,
    iterator: IteratorType,
}

impl SelectOptions {
    /// Creates options with no limit, no offset, and the `EQ` iterator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of tuples to return.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the number of matching tuples to skip.
    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Sets the search direction and inclusivity.
    pub fn iterator(mut self, iterator: IteratorType) -> Self {
        self.iterator = iterator;
        self
    }
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            limit: u32::MAX,
            offset: 0,
            iterator: IteratorType::Eq,
        }
    }
}

/// The main entry point for talking to a tuple store.
///
/// One client owns exactly one TCP connection and one schema cache. Every
/// operation is `async` and completes exactly once; a request whose reply
/// reports a stale schema version is transparently retried a single time
/// against freshly discovered metadata.
///
/// # Example
///
/// ```ignore
/// let config = ClientConfig::builder().host("127.0.0.1").port(3301).build()?;
/// let client = TupleStoreClient::connect(config).await?;
///
/// client.insert("users", vec![Value::from(1u32), Value::from("alice")]).await?;
/// let rows = client
///     .select("users", "primary", vec![Value::from(1u32)], SelectOptions::new())
///     .await?;
/// ```
#[derive(Debug)]
pub struct TupleStoreClient {
    transport: Transport,
    schema: SchemaCache,
}

impl TupleStoreClient {
    /// Connects to the server and completes the handshake.
    ///
    /// When credentials are configured the authentication exchange runs
    /// before the client is returned; a rejection is terminal. Schema
    /// discovery is lazy and happens on the first named-space operation.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let schema = SchemaCache::new(config.spaces().cloned(), config.default_field_type());
        let transport = Transport::connect(config).await?;
        Ok(Self { transport, schema })
    }

    /// Subscribes to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.transport.subscribe()
    }

    /// Closes the connection, cancelling every pending request.
    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    /// Sends a liveness probe; returns the server's ack code (zero).
    pub async fn ping(&self) -> Result<u32> {
        let response = self.transport.invoke(RequestBody::Ping, None).await?;
        match response.to_error() {
            Some(err) => Err(err),
            None => Ok(response.code),
        }
    }

    /// Inserts a tuple; a duplicate primary key is rejected by the server.
    ///
    /// Returns the stored tuple as echoed back.
    pub async fn insert(
        &self,
        space: impl Into<Space>,
        tuple: Vec<Value>,
    ) -> Result<Vec<Tuple>> {
        match space.into() {
            Space::Named(name) => {
                let (response, descriptor) = self
                    .run_named(&name, |descriptor| {
                        Ok(RequestBody::Insert {
                            space_id: descriptor.id(),
                            tuple: descriptor.pack_tuple(&tuple)?,
                        })
                    })
                    .await?;
                Tuple::decode_rows(response.into_data(), Some(descriptor))
            }
            Space::Id(space_id) => {
                let response = self
                    .run_numeric(|| RequestBody::Insert {
                        space_id,
                        tuple: tuple.clone(),
                    })
                    .await?;
                Tuple::decode_rows(response.into_data(), None)
            }
        }
    }

    /// Inserts a tuple, overwriting any existing tuple with the same key.
    pub async fn replace(
        &self,
        space: impl Into<Space>,
        tuple: Vec<Value>,
    ) -> Result<Vec<Tuple>> {
        match space.into() {
            Space::Named(name) => {
                let (response, descriptor) = self
                    .run_named(&name, |descriptor| {
                        Ok(RequestBody::Replace {
                            space_id: descriptor.id(),
                            tuple: descriptor.pack_tuple(&tuple)?,
                        })
                    })
                    .await?;
                Tuple::decode_rows(response.into_data(), Some(descriptor))
            }
            Space::Id(space_id) => {
                let response = self
                    .run_numeric(|| RequestBody::Replace {
                        space_id,
                        tuple: tuple.clone(),
                    })
                    .await?;
                Tuple::decode_rows(response.into_data(), None)
            }
        }
    }

    /// Deletes the tuple matching `key` on the primary index.
    ///
    /// Returns the removed tuple(s).
    pub async fn delete(&self, space: impl Into<Space>, key: Vec<Value>) -> Result<Vec<Tuple>> {
        match space.into() {
            Space::Named(name) => {
                let (response, descriptor) = self
                    .run_named(&name, |descriptor| {
                        let index = descriptor.index(&IndexRef::Id(0))?;
                        Ok(RequestBody::Delete {
                            space_id: descriptor.id(),
                            index_id: 0,
                            key: descriptor.pack_key(index, &key)?,
                        })
                    })
                    .await?;
                Tuple::decode_rows(response.into_data(), Some(descriptor))
            }
            Space::Id(space_id) => {
                let response = self
                    .run_numeric(|| RequestBody::Delete {
                        space_id,
                        index_id: 0,
                        key: key.clone(),
                    })
                    .await?;
                Tuple::decode_rows(response.into_data(), None)
            }
        }
    }

    /// Selects tuples by key.
    pub async fn select(
        &self,
        space: impl Into<Space>,
        index: impl Into<IndexRef>,
        key: Vec<Value>,
        options: SelectOptions,
    ) -> Result<Vec<Tuple>> {
        let index = index.into();
        match space.into() {
            Space::Named(name) => {
                let (response, descriptor) = self
                    .run_named(&name, |descriptor| {
                        let resolved = descriptor.index(&index)?;
                        Ok(RequestBody::Select {
                            space_id: descriptor.id(),
                            index_id: resolved.id,
                            limit: options.limit,
                            offset: options.offset,
                            iterator: options.iterator,
                            key: descriptor.pack_key(resolved, &key)?,
                        })
                    })
                    .await?;
                Tuple::decode_rows(response.into_data(), Some(descriptor))
            }
            Space::Id(space_id) => {
                let index_id = numeric_index(&index)?;
                let response = self
                    .run_numeric(|| RequestBody::Select {
                        space_id,
                        index_id,
                        limit: options.limit,
                        offset: options.offset,
                        iterator: options.iterator,
                        key: key.clone(),
                    })
                    .await?;
                Tuple::decode_rows(response.into_data(), None)
            }
        }
    }

    /// Selects tuples for several keys, one wire request per key.
    ///
    /// Results are concatenated in key order.
    pub async fn select_multi(
        &self,
        space: impl Into<Space>,
        index: impl Into<IndexRef>,
        keys: Vec<Vec<Value>>,
        options: SelectOptions,
    ) -> Result<Vec<Tuple>> {
        let space = space.into();
        let index = index.into();
        let selects = keys
            .into_iter()
            .map(|key| self.select(space.clone(), index.clone(), key, options));
        let results = futures::future::try_join_all(selects).await?;
        Ok(results.into_iter().flatten().collect())
    }

    /// Applies update operations to the tuple matching `key` on the
    /// primary index. Returns the updated tuple.
    pub async fn update(
        &self,
        space: impl Into<Space>,
        key: Vec<Value>,
        ops: Vec<UpdateOp>,
    ) -> Result<Vec<Tuple>> {
        match space.into() {
            Space::Named(name) => {
                let (response, descriptor) = self
                    .run_named(&name, |descriptor| {
                        let index = descriptor.index(&IndexRef::Id(0))?;
                        Ok(RequestBody::Update {
                            space_id: descriptor.id(),
                            index_id: 0,
                            key: descriptor.pack_key(index, &key)?,
                            ops: encode_ops(&ops, Some(descriptor))?,
                        })
                    })
                    .await?;
                Tuple::decode_rows(response.into_data(), Some(descriptor))
            }
            Space::Id(space_id) => {
                let ops = encode_ops(&ops, None)?;
                let response = self
                    .run_numeric(|| RequestBody::Update {
                        space_id,
                        index_id: 0,
                        key: key.clone(),
                        ops: ops.clone(),
                    })
                    .await?;
                Tuple::decode_rows(response.into_data(), None)
            }
        }
    }

    /// Applies update operations to the tuple sharing `tuple`'s primary
    /// key, inserting `tuple` when there is no match. Returns nothing.
    pub async fn upsert(
        &self,
        space: impl Into<Space>,
        tuple: Vec<Value>,
        ops: Vec<UpdateOp>,
    ) -> Result<()> {
        match space.into() {
            Space::Named(name) => {
                self.run_named(&name, |descriptor| {
                    Ok(RequestBody::Upsert {
                        space_id: descriptor.id(),
                        tuple: descriptor.pack_tuple(&tuple)?,
                        ops: encode_ops(&ops, Some(descriptor))?,
                    })
                })
                .await?;
            }
            Space::Id(space_id) => {
                let ops = encode_ops(&ops, None)?;
                self.run_numeric(|| RequestBody::Upsert {
                    space_id,
                    tuple: tuple.clone(),
                    ops: ops.clone(),
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Calls a server-side procedure, returning its raw result rows.
    pub async fn call(&self, function: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        let response = self
            .run_numeric(|| RequestBody::Call {
                function: function.to_string(),
                args: args.clone(),
            })
            .await?;
        Ok(response.into_data())
    }

    /// Runs a named-space operation with the one-shot stale-schema retry.
    ///
    /// The body is rebuilt against the refreshed descriptors on retry, so
    /// renamed ids and changed field types are picked up.
    async fn run_named<F>(
        &self,
        space_name: &str,
        build: F,
    ) -> Result<(Response, Arc<SpaceDescriptor>)>
    where
        F: Fn(&SpaceDescriptor) -> Result<RequestBody>,
    {
        let (descriptor, version) = self.schema.descriptor(&self.transport, space_name).await?;
        let response = self.transport.invoke(build(&descriptor)?, version).await?;
        match response.to_error() {
            None => Ok((response, descriptor)),
            Some(err) if err.is_schema_mismatch() => {
                debug!(space = space_name, "stale schema reported, retrying once");
                self.schema.invalidate().await;
                let (descriptor, version) =
                    self.schema.descriptor(&self.transport, space_name).await?;
                let response = self.transport.invoke(build(&descriptor)?, version).await?;
                match response.to_error() {
                    None => Ok((response, descriptor)),
                    // A second stale-schema in a row surfaces as-is.
                    Some(err) => Err(err),
                }
            }
            Some(err) => Err(err),
        }
    }

    /// Runs a numeric-space operation with the one-shot stale-schema retry.
    ///
    /// The retry clears the cached schema version, reissuing the request
    /// untagged so the server applies its current schema.
    async fn run_numeric<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBody,
    {
        let version = self.schema.version().await;
        let response = self.transport.invoke(build(), version).await?;
        match response.to_error() {
            None => Ok(response),
            Some(err) if err.is_schema_mismatch() => {
                debug!("stale schema reported, retrying once");
                self.schema.invalidate().await;
                let version = self.schema.version().await;
                let response = self.transport.invoke(build(), version).await?;
                match response.to_error() {
                    None => Ok(response),
                    Some(err) => Err(err),
                }
            }
            Some(err) => Err(err),
        }
    }
}

fn numeric_index(index: &IndexRef) -> Result<u32> {
    match index {
        IndexRef::Id(id) => Ok(*id),
        IndexRef::Named(name) => Err(TupleStoreError::Schema(format!(
            "index name '{name}' requires a named space"
        ))),
    }
}

fn encode_ops(ops: &[UpdateOp], descriptor: Option<&SpaceDescriptor>) -> Result<Vec<Value>> {
    ops.iter().map(|op| op.encode(descriptor)).collect()
}
