//! Transport seam
//!
//! Request/reply per rank plus the collective scan broadcast. Delivery is
//! at least once: calls may duplicate, reorder, or fail with a group
//! version error, and every handler is written to tolerate that.

use bytes::Bytes;
use futures::future::join_all;
use tessel_core::Rank;

use crate::error::Result;
use crate::messages::{
    FetchReply, FetchRequest, LeaderNotice, ObjectListRequest, ScanReply, ScanRequest,
    StatusReport, ValuesRequest,
};

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn scan(&self, rank: Rank, req: ScanRequest) -> Result<ScanReply>;

    /// Collective scan; fails as a whole if any participant fails
    async fn broadcast_scan(
        &self,
        ranks: &[Rank],
        req: ScanRequest,
    ) -> Result<Vec<(Rank, ScanReply)>> {
        let calls = ranks.iter().map(|&rank| {
            let req = req.clone();
            async move { (rank, self.scan(rank, req).await) }
        });

        let mut replies = Vec::with_capacity(ranks.len());
        for (rank, result) in join_all(calls).await {
            replies.push((rank, result?));
        }
        Ok(replies)
    }

    async fn object_list(&self, rank: Rank, req: ObjectListRequest) -> Result<()>;

    async fn fetch_object(&self, rank: Rank, req: FetchRequest) -> Result<FetchReply>;

    /// Bulk fetch: the values of `req.iods` back to back in one buffer
    async fn fetch_values(&self, rank: Rank, req: ValuesRequest) -> Result<Bytes>;

    async fn report_status(&self, rank: Rank, report: StatusReport) -> Result<()>;

    async fn leader_notice(&self, rank: Rank, notice: LeaderNotice) -> Result<()>;
}
