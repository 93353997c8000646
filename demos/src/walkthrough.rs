use anyhow::Context;
use acl_core::{Ace, MatchMode, MutableAclProvider as _, ObjectIdentity, SecurityIdentity};
use acl_libsql::LibSqlAclProvider;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::SubscriberBuilder::default()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(true)
        .init();

    // 1) Build an in-memory libSQL database and open a provider against it.
    let db_path = std::env::temp_dir().join("acl-walkthrough.db");
    let db_path = db_path.to_str().context("non-utf8 temp path")?;
    let _ = std::fs::remove_file(db_path);

    let provider = LibSqlAclProvider::open(db_path).await.context("open provider")?;

    // 2) Apply PRAGMAs and run migrations.
    provider.setup().await.context("setup provider")?;

    // 3) Create an ACL for a new object.
    let report = ObjectIdentity::new("document", "quarterly-report");
    let acl = provider.create_acl(report.clone()).await.context("create acl")?;
    println!("created acl for {:?}, inherits={}", report, acl.entries_inheriting());

    // 4) Insert an object-scope ACE granting read+write to a user.
    const READ: i32 = 0b01;
    const WRITE: i32 = 0b10;
    let alice = SecurityIdentity::user("document", "alice");
    acl.insert_object_ace(Ace::new(alice.clone(), READ | WRITE, true, MatchMode::Equal), None)
        .context("insert ace")?;

    // 5) Evaluate a permission before persisting: this is purely in-memory.
    let granted = provider.is_granted(&acl, &[READ], &[alice.clone()], false)?;
    println!("alice can read (pre-persist): {granted}");

    // 6) Persist the mutation.
    provider.update_acl(&acl).await.context("persist ace insert")?;

    // 7) Reload from a second provider instance pointed at the same database
    //    file, to confirm the ACE round-trips through storage rather than
    //    just living in the first provider's identity map.
    let second_provider = LibSqlAclProvider::open(db_path).await.context("reopen provider")?;
    second_provider.setup().await.context("setup second provider")?;

    let reloaded = second_provider
        .find_acl(&report, None)
        .await
        .context("find acl from second provider")?;
    let granted_after_reload = second_provider.is_granted(&reloaded, &[WRITE], &[alice], false)?;
    println!("alice can write (after reload): {granted_after_reload}");

    let _ = std::fs::remove_file(db_path);

    Ok(())
}
