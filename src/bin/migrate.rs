//! Applies the core's schema migrations. The thin runner an operator
//! invokes before starting `worker`.

use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new().connect(&database_url).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    println!("migrations applied");
    Ok(())
}
