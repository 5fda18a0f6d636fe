use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::unbounded_channel;
use tracing::debug;

use crate::{
    error::ChatError,
    store::{CollectionQuery, Document, RealtimeStore},
    task::Task,
    types::{Result, SubscriptionState, Unsubscribe},
};

// The store callback only enqueues; the consumer skips to the newest queued snapshot.
pub struct Subscription {
    query: CollectionQuery,
    mutable_state: Mutex<SubscriptionMutableState>,
}

#[derive(Default)]
struct SubscriptionMutableState {
    state: SubscriptionState,
    unsubscribe: Option<Unsubscribe>,
    consumer: Option<Task<()>>,
}

impl SubscriptionMutableState {
    fn release(&mut self) {
        if let Some(mut unsubscribe) = self.unsubscribe.take() {
            unsubscribe.unsubscribe();
        }
        if let Some(consumer) = self.consumer.take() {
            consumer.cancel();
        }
        self.state = SubscriptionState::Unsubscribed;
    }
}

impl Subscription {
    pub fn new(query: CollectionQuery) -> Self {
        Self {
            query,
            mutable_state: Mutex::new(SubscriptionMutableState::default()),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.lock().state
    }

    pub fn collection(&self) -> &str {
        &self.query.collection
    }

    pub async fn activate<F, Fut>(&self, store: &dyn RealtimeStore, mut on_snapshot: F) -> Result<()>
    where
        F: FnMut(Vec<Document>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        {
            let mut mutable_state = self.lock();
            if mutable_state.state != SubscriptionState::Unsubscribed {
                return Err(ChatError::AlreadySubscribed {
                    collection: self.query.collection.clone(),
                });
            }
            mutable_state.state = SubscriptionState::Subscribing;
        }

        let (sender, mut receiver) = unbounded_channel::<Vec<Document>>();
        let collection = self.query.collection.clone();
        let on_store_snapshot = move |documents: Vec<Document>| {
            if sender.send(documents).is_err() {
                debug!("subscription: dropped snapshot for '{collection}' after teardown.");
            }
        };

        let result = store
            .subscribe_collection(self.query.clone(), Box::new(on_store_snapshot))
            .await;

        let mut mutable_state = self.lock();
        let mut unsubscribe = match result {
            Ok(unsubscribe) => unsubscribe,
            Err(error) => {
                mutable_state.state = SubscriptionState::Unsubscribed;
                return Err(error);
            }
        };

        // torn down while the store was still registering us
        if mutable_state.state != SubscriptionState::Subscribing {
            unsubscribe.unsubscribe();
            return Ok(());
        }

        let consumer = Task::spawn(async move {
            while let Some(mut documents) = receiver.recv().await {
                while let Ok(newer) = receiver.try_recv() {
                    documents = newer;
                }
                on_snapshot(documents).await;
            }
        });

        mutable_state.unsubscribe = Some(unsubscribe);
        mutable_state.consumer = Some(consumer);
        mutable_state.state = SubscriptionState::Active;
        debug!("subscription: '{}' is active.", self.query.collection);

        Ok(())
    }

    /// Safe to call in any state and any number of times.
    pub fn teardown(&self) {
        let mut mutable_state = self.lock();
        if mutable_state.state != SubscriptionState::Unsubscribed {
            debug!("subscription: tearing down '{}'.", self.query.collection);
        }
        mutable_state.release();
    }

    fn lock(&self) -> MutexGuard<'_, SubscriptionMutableState> {
        self.mutable_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.teardown();
    }
}
