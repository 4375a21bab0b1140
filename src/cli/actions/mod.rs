pub mod server;

mod run;

#[derive(Debug)]
pub enum Action {
    Server(server::Args),
}

impl Action {
    /// Execute the action.
    ///
    /// # Errors
    /// Propagates errors from the underlying action.
    pub async fn execute(self) -> anyhow::Result<()> {
        run::execute(self).await
    }
}
