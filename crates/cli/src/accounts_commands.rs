use {
    anyhow::Result,
    clap::Subcommand,
    wagate_config::Layout,
    wagate_store::{AccountStore, SqliteAccountStore},
};

#[derive(Subcommand)]
pub enum AccountsAction {
    /// List stored instances.
    List,
    /// Delete the stored credentials of an instance.
    ///
    /// Use this only while the gateway is stopped; a running gateway should
    /// be asked to log the instance out instead.
    Remove { instance_id: String },
}

pub async fn handle_accounts(action: AccountsAction, layout: &Layout) -> Result<()> {
    let pool = wagate_store::open(&layout.database_url).await?;
    let store = SqliteAccountStore::new(pool);
    match action {
        AccountsAction::List => list(&store).await,
        AccountsAction::Remove { instance_id } => remove(&store, &instance_id).await,
    }
}

async fn list(store: &dyn AccountStore) -> Result<()> {
    let accounts = store.list().await?;
    if accounts.is_empty() {
        println!("No stored instances.");
        return Ok(());
    }
    println!("{:<32} {:<20} {:>15}", "INSTANCE", "OWNER", "UPDATED (ms)");
    for account in &accounts {
        println!(
            "{:<32} {:<20} {:>15}",
            account.instance_id,
            account.owner_id.as_deref().unwrap_or("-"),
            account.updated_at
        );
    }
    Ok(())
}

async fn remove(store: &dyn AccountStore, instance_id: &str) -> Result<()> {
    if store.delete(instance_id).await? {
        println!("Removed {instance_id}.");
    } else {
        println!("No stored instance named {instance_id}.");
    }
    Ok(())
}
