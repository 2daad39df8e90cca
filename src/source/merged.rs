use futures_core::stream::BoxStream;
use tokio_stream::{StreamExt as _, StreamMap};

use super::{MessageSource, SourceItem};

/// Several sources of the same logical type, read as one stream.
///
/// Items of each source keep their relative order; items of different
/// sources are interleaved as they arrive.
pub struct MergedSource<L: ?Sized> {
    sources: Vec<Box<dyn MessageSource<L>>>,
}

impl<L: ?Sized> MergedSource<L> {
    pub fn new(sources: Vec<Box<dyn MessageSource<L>>>) -> Self {
        Self { sources }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl<L> MessageSource<L> for MergedSource<L>
where
    L: ?Sized + Send + Sync + 'static,
{
    fn messages(&self) -> BoxStream<'static, SourceItem<L>> {
        let mut streams = StreamMap::with_capacity(self.sources.len());
        for (index, source) in self.sources.iter().enumerate() {
            streams.insert(index, source.messages());
        }

        Box::pin(streams.map(|(_, item)| item))
    }

    fn dispose(&self) {
        for source in &self.sources {
            source.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, atomic::AtomicUsize},
        time::Duration,
    };

    use tokio_stream::StreamExt as _;

    use super::*;
    use crate::{
        MessageTypeMapping,
        association::AssociationTable,
        source::{
            DefaultSourceHook, Source, SourceOptions,
            tests::{Tick, broker, envelope, tick_deserializer},
        },
        transport::TransportFactory,
    };

    fn source(broker: &crate::transport::InMemory, path: &str) -> Box<dyn MessageSource<Tick>> {
        let mapping = MessageTypeMapping::queue::<Tick>(path);
        let receiver = broker.create_receiver(&mapping).unwrap();
        let deserializers = HashMap::from([("Tick", tick_deserializer(Arc::new(AtomicUsize::new(0))))]);

        Box::new(
            Source::new(
                mapping,
                receiver,
                deserializers,
                Arc::new(AssociationTable::default()),
                Arc::new(DefaultSourceHook),
                SourceOptions::default(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn merged_streams_keep_per_source_order() {
        let broker = broker();
        let merged = MergedSource::new(vec![source(&broker, "a"), source(&broker, "b")]);

        for i in 0..3 {
            broker.send_raw("a", envelope(Some("Tick"), &i.to_string())).await;
            broker.send_raw("b", envelope(Some("Tick"), &(100 + i).to_string())).await;
        }

        let mut stream = merged.messages();
        let mut values = Vec::new();
        while values.len() < 6 {
            let item = tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .expect("stream stalled")
                .unwrap();
            values.push(item.unwrap().0);
        }

        let from_a: Vec<_> = values.iter().copied().filter(|v| *v < 100).collect();
        let from_b: Vec<_> = values.iter().copied().filter(|v| *v >= 100).collect();
        assert_eq!(from_a, vec![0, 1, 2]);
        assert_eq!(from_b, vec![100, 101, 102]);
    }

    #[tokio::test]
    async fn merged_stream_ends_when_every_source_is_disposed() {
        let broker = broker();
        let merged = MergedSource::new(vec![source(&broker, "a"), source(&broker, "b")]);

        let mut stream = merged.messages();
        merged.dispose();

        let end = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("stream stalled");
        assert!(end.is_none());
    }
}
