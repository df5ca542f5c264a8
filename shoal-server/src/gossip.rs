//! The announce loop.
//!
//! On a fixed cadence, tell every neighbor who we are and learn who they
//! know. The announce answer carries the responder's record and its
//! neighbor list; both are merged into our view, most recently seen
//! record winning.

use shoal_core::{AnnounceResponse, Cluster, Node};
use std::sync::Arc;
use std::time::Duration;

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn announce_loop(cluster: Arc<Cluster>, sleep_secs: u64) {
    let client = match reqwest::Client::builder().timeout(ANNOUNCE_TIMEOUT).build() {
        Ok(client) => client,
        Err(error) => {
            tracing::error!("could not build announce client: {}", error);
            return;
        }
    };

    let mut interval = tokio::time::interval(Duration::from_secs(sleep_secs.max(1)));
    loop {
        interval.tick().await;
        announce_round(&cluster, &client).await;
    }
}

pub(crate) async fn announce_round(cluster: &Cluster, client: &reqwest::Client) {
    let myself = cluster.myself().await;

    for neighbor in cluster.neighbors().await {
        let form = [
            ("uuid", myself.uuid.clone()),
            ("nickname", myself.nickname.clone()),
            ("location", myself.location.clone()),
            ("base_url", myself.base_url.clone()),
            ("writeable", myself.writeable.to_string()),
        ];

        let response = client
            .post(neighbor.announce_url())
            .form(&form)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                cluster.mark_seen(&neighbor.uuid).await;
                match response.json::<AnnounceResponse>().await {
                    Ok(answer) => merge_answer(cluster, answer).await,
                    Err(error) => {
                        tracing::debug!("bad announce answer from {}: {}", neighbor.uuid, error)
                    }
                }
            }
            Ok(response) => {
                tracing::debug!(
                    "announce to {} answered {}",
                    neighbor.uuid,
                    response.status()
                );
                cluster.mark_seen(&neighbor.uuid).await;
            }
            Err(error) => {
                tracing::debug!("announce to {} failed: {}", neighbor.uuid, error);
                cluster.mark_failed(&neighbor.uuid).await;
            }
        }
    }
}

async fn merge_answer(cluster: &Cluster, answer: AnnounceResponse) {
    let mut records = answer.neighbors;

    // The responder vouches for itself; fold its own record in as
    // freshly seen.
    let mut own = Node::new(
        &answer.nickname,
        &answer.uuid,
        &answer.base_url,
        &answer.location,
        answer.writeable,
    );
    own.last_seen = chrono::Utc::now();
    records.push(own);

    cluster.merge_neighbors(records).await;
}
