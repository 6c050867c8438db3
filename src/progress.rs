//! Progress bars for downloads the CLI is waiting on.

use std::collections::HashMap;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use resumable_dl::{DownloadRecord, DownloadStatus};

/// Renders one bar per watched download.
pub(crate) struct ProgressView {
    multi: MultiProgress,
    bars: HashMap<i64, ProgressBar>,
    style: ProgressStyle,
}

impl ProgressView {
    pub(crate) fn new(visible: bool) -> Self {
        let target = if visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        let style = ProgressStyle::with_template(
            "{msg:30!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {binary_bytes_per_sec}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: HashMap::new(),
            style,
        }
    }

    fn update(&mut self, record: &DownloadRecord) {
        let bar = self.bars.entry(record.id).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(0));
            bar.set_style(self.style.clone());
            bar.set_message(record.file_name.clone());
            bar
        });
        if bar.is_finished() {
            return;
        }

        bar.set_length(u64::try_from(record.total_bytes).unwrap_or(0));
        bar.set_position(u64::try_from(record.downloaded_bytes).unwrap_or(0));
        if !record.status.is_active() {
            bar.abandon_with_message(format!("{} ({})", record.file_name, record.status));
        }
    }
}

/// Follows `updates` until none of `ids` is queued or running.
///
/// Returns the last snapshot of each watched record still present.
pub(crate) async fn watch_until_settled(
    mut updates: BoxStream<'static, Vec<DownloadRecord>>,
    ids: &[i64],
    view: &mut ProgressView,
) -> Vec<DownloadRecord> {
    let mut latest = Vec::new();
    while let Some(records) = updates.next().await {
        latest = records
            .into_iter()
            .filter(|record| ids.contains(&record.id))
            .collect();
        for record in &latest {
            view.update(record);
        }
        if latest.iter().all(|record| !record.status.is_active()) {
            break;
        }
    }
    latest
}

/// Counts records that did not end in [`DownloadStatus::Success`].
pub(crate) fn unfinished(records: &[DownloadRecord]) -> usize {
    records
        .iter()
        .filter(|record| record.status != DownloadStatus::Success)
        .count()
}

#[cfg(test)]
mod tests {
    use futures_util::stream;
    use resumable_dl::UserAction;

    use super::*;

    fn record(id: i64, status: DownloadStatus) -> DownloadRecord {
        DownloadRecord {
            id,
            url: format!("https://example.com/{id}.bin"),
            file_path: "/tmp".to_string(),
            file_name: format!("{id}.bin"),
            tag: String::new(),
            headers: HashMap::new(),
            status,
            action: UserAction::Start,
            total_bytes: 100,
            downloaded_bytes: 50,
            part1_bytes: 50,
            part2_bytes: 0,
            part3_bytes: 0,
            part4_bytes: 0,
            part5_bytes: 0,
            speed_per_ms: 0.0,
            e_tag: String::new(),
            queue_time: 0,
            modified_time: 0,
            failure_reason: String::new(),
            metadata: String::new(),
            job_uuid: String::new(),
        }
    }

    #[tokio::test]
    async fn test_watch_stops_once_watched_records_settle() {
        let snapshots = vec![
            vec![
                record(1, DownloadStatus::InProgress),
                record(2, DownloadStatus::Queued),
            ],
            vec![
                record(1, DownloadStatus::Success),
                record(2, DownloadStatus::InProgress),
                record(3, DownloadStatus::Queued),
            ],
            vec![
                record(1, DownloadStatus::Success),
                record(2, DownloadStatus::Failed),
                record(3, DownloadStatus::InProgress),
            ],
            vec![record(99, DownloadStatus::Queued)],
        ];
        let mut view = ProgressView::new(false);

        let settled =
            watch_until_settled(stream::iter(snapshots).boxed(), &[1, 2], &mut view).await;

        assert_eq!(settled.len(), 2);
        assert_eq!(unfinished(&settled), 1);
        assert!(view.bars.values().all(ProgressBar::is_finished));
    }

    #[tokio::test]
    async fn test_watch_ignores_unwatched_activity() {
        let snapshots = vec![vec![
            record(1, DownloadStatus::Paused),
            record(2, DownloadStatus::InProgress),
        ]];
        let mut view = ProgressView::new(false);

        let settled = watch_until_settled(stream::iter(snapshots).boxed(), &[1], &mut view).await;

        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].status, DownloadStatus::Paused);
        assert_eq!(view.bars.len(), 1);
    }
}
