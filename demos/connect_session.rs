use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use syncstage_sdk::stream::events::{DesktopAgentDelegate, UserDelegate};
use syncstage_sdk::stream::proto::Connection;
use syncstage_sdk::SyncStageBuilder;
use tracing_subscriber::EnvFilter;

struct PrintEvents;

impl UserDelegate for PrintEvents {
    fn user_joined(&self, connection: &Connection) {
        println!("joined identifier={} user={}", connection.identifier, connection.user_id);
    }

    fn user_left(&self, identifier: &str) {
        println!("left identifier={identifier}");
    }
}

impl DesktopAgentDelegate for PrintEvents {
    fn desktop_agent_acquired(&self) {
        println!("desktop agent is held by another client");
    }

    fn desktop_agent_disconnected(&self) {
        println!("desktop agent went silent");
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let token = "REPLACE_WITH_APP_TOKEN".to_string();
    let user_id = "REPLACE_WITH_USER_ID";

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let events = Arc::new(PrintEvents);
        let sdk = SyncStageBuilder::local()
            .with_user_delegate(events.clone())
            .with_desktop_agent_delegate(events)
            .build();

        if !sdk.wait_for_connection(Duration::from_secs(10)).await {
            return Err("desktop agent did not answer".into());
        }
        sdk.init(token).await?;

        let server = sdk.get_best_available_server().await?;
        let created = sdk
            .create_session(&server.zone_id, &server.studio_server_id, user_id)
            .await?;
        let session = sdk
            .join(
                &created.session_code,
                user_id,
                &server.zone_id,
                &server.studio_server_id,
                Some("Demo"),
            )
            .await?;
        println!(
            "joined session_id={} code={} receivers={}",
            session.session_id,
            session.session_code,
            session.receivers.len()
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        sdk.leave().await?;
        sdk.shutdown().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
