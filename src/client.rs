//! The public entry point.
//!
//! A [`Client`] owns one [`Supervisor`] and the [`Schema`] cache built on top of it. It is
//! `Send + Sync`; share it between threads behind an `Arc` and every thread's requests
//! are pipelined over the same connection.
use std::sync::Arc;

use log::info;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    config::ClientConfig,
    connection::Supervisor,
    error::ClientError,
    protocol::{Request, SqlResponse},
    schema::{Schema, Space, into_tuple},
};

pub struct Client {
    supervisor: Arc<Supervisor>,
    schema: Schema,
}

impl Client {
    /// Builds a client without dialing; the first request connects.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let supervisor = Supervisor::new(config)?;
        let schema = Schema::new(&supervisor);
        Ok(Self { supervisor, schema })
    }

    /// Builds a client, connects and loads the schema.
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let client = Self::new(config)?;
        client.supervisor.ensure_connected()?;
        client.schema.reload()?;
        info!("client ready, {} spaces visible", client.schema.len());
        Ok(client)
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn config(&self) -> &ClientConfig {
        self.supervisor.config()
    }

    pub fn is_connected(&self) -> bool {
        self.supervisor.is_connected()
    }

    pub fn ping(&self) -> Result<(), ClientError> {
        self.supervisor.ping()
    }

    /// Calls a stored function; `args` is sent as the argument tuple.
    pub fn call<A, R>(&self, function: &str, args: &A) -> Result<R, ClientError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let request = Request::Call {
            function: function.to_string(),
            args: into_tuple(args)?,
        };
        self.supervisor.send(&request, None)?.into_data()
    }

    /// Calls a stored function with the pre-1.7 call code, which wraps every result
    /// into a tuple.
    pub fn call_legacy<A, R>(&self, function: &str, args: &A) -> Result<R, ClientError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let request = Request::OldCall {
            function: function.to_string(),
            args: into_tuple(args)?,
        };
        self.supervisor.send(&request, None)?.into_data()
    }

    pub fn eval<A, R>(&self, expression: &str, args: &A) -> Result<R, ClientError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let request = Request::Eval {
            expression: expression.to_string(),
            args: into_tuple(args)?,
        };
        self.supervisor.send(&request, None)?.into_data()
    }

    /// Runs an SQL statement with positional bind parameters.
    pub fn execute<P>(&self, sql: &str, params: &P) -> Result<SqlResponse, ClientError>
    where
        P: Serialize,
    {
        let request = Request::Execute {
            sql: sql.to_string(),
            params: into_tuple(params)?,
        };
        let response = self.supervisor.send(&request, None)?;
        Ok(SqlResponse::try_from(response)?)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn space(&self, name: &str) -> Result<Arc<Space>, ClientError> {
        self.schema.space(name)
    }

    pub fn space_by_id(&self, id: u32) -> Result<Arc<Space>, ClientError> {
        self.schema.space_by_id(id)
    }

    pub fn reload_schema(&self) -> Result<(), ClientError> {
        self.schema.reload()
    }

    /// Pings that timed out since the client was built.
    pub fn failed_pings(&self) -> u64 {
        self.supervisor.failed_pings()
    }

    /// Closes the connection and fails any request still in flight.
    pub fn dispose(self) {
        self.supervisor.disconnect();
    }
}
