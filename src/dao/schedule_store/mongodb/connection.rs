use mongodb::{Client, Database, bson::doc, options::ClientOptions};

use super::error::{MongoDaoError, MongoResult};
use crate::dao::schedule_store::retry::{Exhausted, with_backoff};

/// Build the client, wait for the server to answer, then make sure it can
/// run multi-document transactions.
pub async fn establish_connection(
    options: &ClientOptions,
    database_name: &str,
) -> MongoResult<(Client, Database)> {
    let client = Client::with_options(options.clone())
        .map_err(|source| MongoDaoError::ClientConstruction { source })?;
    let database = client.database(database_name);

    let db = &database;
    with_backoff("MongoDB initial ping", move || async move {
        db.run_command(doc! { "ping": 1 }).await
    })
    .await
    .map_err(|Exhausted { attempts, source }| MongoDaoError::InitialPing { attempts, source })?;

    let hello = database
        .run_command(doc! { "hello": 1 })
        .await
        .map_err(MongoDaoError::operation("hello"))?;
    let replicated =
        hello.get_str("setName").is_ok() || matches!(hello.get_str("msg"), Ok("isdbgrid"));
    if !replicated {
        return Err(MongoDaoError::NotReplicated);
    }

    Ok((client, database))
}
