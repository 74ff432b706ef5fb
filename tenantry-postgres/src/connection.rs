//! PostgreSQL session connection.

use async_trait::async_trait;
use deadpool_postgres::ClientWrapper;
use tenantry_core::tenant::{parse_search_path, quote_ident};
use tenantry_core::{
    AssertScope, DbError, DbResult, Row, SchemaName, SchemaObject, SearchPath, SessionConnection,
    Value,
};
use tokio_postgres::types::ToSql;
use tracing::debug;

use crate::error::classify;
use crate::types::{from_pg_rows, to_sql_params};

/// Statements that return a recycled connection to a clean session.
///
/// Prepared statements survive so the statement cache stays valid.
const CLEAN_SQL: &str = "CLOSE ALL; SET SESSION AUTHORIZATION DEFAULT; RESET ALL; \
                         UNLISTEN *; SELECT pg_advisory_unlock_all(); DISCARD TEMP;";

fn pg(err: tokio_postgres::Error) -> DbError {
    classify(&err)
}

/// A pooled PostgreSQL connection with typed session-state operations.
pub struct PgSessionConnection {
    client: ClientWrapper,
    backend_pid: u64,
    in_transaction: bool,
}

impl std::fmt::Debug for PgSessionConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSessionConnection")
            .field("backend_pid", &self.backend_pid)
            .field("in_transaction", &self.in_transaction)
            .field("closed", &self.client.is_closed())
            .finish()
    }
}

impl PgSessionConnection {
    /// Wrap a freshly opened client.
    pub(crate) async fn open(client: ClientWrapper) -> DbResult<Self> {
        let row = client
            .query_one("SELECT pg_catalog.pg_backend_pid()", &[])
            .await
            .map_err(pg)?;
        let pid: i32 = row.try_get(0).map_err(pg)?;
        debug!(backend_pid = pid, "Opened PostgreSQL connection");
        Ok(Self {
            client,
            backend_pid: u64::try_from(pid).unwrap_or_default(),
            in_transaction: false,
        })
    }

    /// Server process id of this connection.
    pub fn backend_pid(&self) -> u64 {
        self.backend_pid
    }

    /// Drop session state left behind by a previous user.
    pub(crate) async fn clean(&mut self) -> DbResult<()> {
        if self.client.is_closed() {
            return Err(DbError::closed("connection closed by server"));
        }
        if self.in_transaction {
            self.rollback().await?;
        }
        self.client.batch_execute(CLEAN_SQL).await.map_err(pg)
    }

    async fn simple(&mut self, sql: &str) -> DbResult<()> {
        debug!(sql = %sql, backend_pid = self.backend_pid, "Executing session statement");
        self.client.batch_execute(sql).await.map_err(pg)
    }

    async fn prepared(
        &self,
        sql: &str,
        params: &[Value],
    ) -> DbResult<(tokio_postgres::Statement, Vec<crate::types::SqlParam>)> {
        let stmt = self.client.prepare_cached(sql).await.map_err(pg)?;
        let params = to_sql_params(params, stmt.params())?;
        Ok((stmt, params))
    }
}

fn as_refs(params: &[crate::types::SqlParam]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// `CREATE PROCEDURE` statement for a schema's assertion procedure.
///
/// The procedure takes one argument, `is_local`, and installs `path` with
/// `set_config` so that the context is transaction-local when it is true.
pub fn assert_procedure_sql(schema: &SchemaName, name: &str, path: &SearchPath) -> String {
    format!(
        "CREATE PROCEDURE {schema}.{name}(is_local boolean DEFAULT true)\n\
         LANGUAGE plpgsql\n\
         AS $tenantry$\n\
         BEGIN\n    \
             PERFORM pg_catalog.set_config('search_path', {setting}, is_local);\n\
         END\n\
         $tenantry$",
        schema = schema.quoted(),
        name = quote_ident(name),
        setting = quote_literal(&path.to_setting()),
    )
}

#[async_trait]
impl SessionConnection for PgSessionConnection {
    fn connection_id(&self) -> u64 {
        self.backend_pid
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.simple("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        // The transaction ends whether COMMIT succeeds or not.
        self.in_transaction = false;
        self.simple("COMMIT").await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.in_transaction = false;
        self.simple("ROLLBACK").await
    }

    async fn savepoint(&mut self, name: &str) -> DbResult<()> {
        self.simple(&format!("SAVEPOINT {}", quote_ident(name))).await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.simple(&format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)))
            .await
    }

    async fn release_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.simple(&format!("RELEASE SAVEPOINT {}", quote_ident(name)))
            .await
    }

    async fn set_search_path(&mut self, path: &SearchPath, scope: AssertScope) -> DbResult<()> {
        let setting = path.to_setting();
        let is_local = scope.is_local();
        debug!(path = %setting, is_local, backend_pid = self.backend_pid, "Setting search_path");
        self.client
            .query_one(
                "SELECT pg_catalog.set_config('search_path', $1, $2)",
                &[&setting, &is_local],
            )
            .await
            .map_err(pg)?;
        Ok(())
    }

    async fn reset_search_path(&mut self) -> DbResult<()> {
        self.simple("SET search_path TO DEFAULT").await
    }

    async fn call_assert_procedure(
        &mut self,
        schema: &SchemaName,
        procedure: &str,
        scope: AssertScope,
    ) -> DbResult<()> {
        let sql = format!("CALL {}.{}($1)", schema.quoted(), quote_ident(procedure));
        debug!(sql = %sql, backend_pid = self.backend_pid, "Calling assertion procedure");
        self.client
            .execute(sql.as_str(), &[&scope.is_local()])
            .await
            .map_err(pg)?;
        Ok(())
    }

    async fn search_path(&mut self) -> DbResult<Vec<String>> {
        let row = self
            .client
            .query_one("SELECT pg_catalog.current_setting('search_path')", &[])
            .await
            .map_err(pg)?;
        let setting: String = row.try_get(0).map_err(pg)?;
        Ok(parse_search_path(&setting))
    }

    async fn current_schema(&mut self) -> DbResult<Option<String>> {
        let row = self
            .client
            .query_one("SELECT pg_catalog.current_schema()::text", &[])
            .await
            .map_err(pg)?;
        row.try_get(0).map_err(pg)
    }

    async fn schema_exists(&mut self, schema: &SchemaName) -> DbResult<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname::text = $1)",
                &[&schema.as_str()],
            )
            .await
            .map_err(pg)?;
        row.try_get(0).map_err(pg)
    }

    async fn list_schemas(&mut self, prefix: &str) -> DbResult<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT nspname::text FROM pg_catalog.pg_namespace \
                 WHERE left(nspname::text, length($1)) = $1 ORDER BY nspname",
                &[&prefix],
            )
            .await
            .map_err(pg)?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(pg))
            .collect()
    }

    async fn create_schema(&mut self, schema: &SchemaName) -> DbResult<()> {
        self.simple(&format!("CREATE SCHEMA {}", schema.quoted()))
            .await
    }

    async fn create_object(
        &mut self,
        schema: &SchemaName,
        object: &SchemaObject,
        path: &SearchPath,
    ) -> DbResult<()> {
        let sql = match object {
            SchemaObject::Table { name, definition } => format!(
                "CREATE TABLE {}.{} ({})",
                schema.quoted(),
                quote_ident(name),
                definition
            ),
            SchemaObject::Routine { definition, .. } => {
                SchemaObject::render_definition(definition, schema)
            }
            SchemaObject::AssertProcedure { name } => assert_procedure_sql(schema, name, path),
        };
        self.simple(&sql).await
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> DbResult<u64> {
        debug!(sql = %sql, backend_pid = self.backend_pid, "Executing statement");
        let (stmt, params) = self.prepared(sql, params).await?;
        self.client
            .execute(&stmt, &as_refs(&params))
            .await
            .map_err(pg)
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> DbResult<Vec<Row>> {
        debug!(sql = %sql, backend_pid = self.backend_pid, "Executing query");
        let (stmt, params) = self.prepared(sql, params).await?;
        let rows = self
            .client
            .query(&stmt, &as_refs(&params))
            .await
            .map_err(pg)?;
        Ok(from_pg_rows(&rows)?)
    }
}
