// =============================================================================
// Price publisher — routes price/signal deltas to subscribers
// =============================================================================
//
// Price data comes from the signal set (the engine stored price and
// change there at compute time) with the K-line last bar as fallback for
// plain stock subscriptions. A test-mode switch overlays a bounded random
// walk (±0.20 – ±0.69) on every published price for load testing; stored
// state is never touched.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::ServiceResult;
use crate::model::SignalRecord;
use crate::store::KlineStore;
use crate::strategy::StrategyEngine;
use crate::types::ts_code_for;
use crate::ws::messages::{
    PriceUpdate, PriceUpdateMessage, SignalUpdateMessage, SubscriptionType,
};
use crate::ws::WsHub;

pub struct PricePublisher {
    hub: Arc<WsHub>,
    engine: Arc<StrategyEngine>,
    kline: Arc<KlineStore>,
    /// Load-test switch: overlay a bounded random walk on every price.
    simulate: bool,
}

impl PricePublisher {
    pub fn new(hub: Arc<WsHub>, engine: Arc<StrategyEngine>, kline: Arc<KlineStore>) -> Self {
        Self {
            hub,
            engine,
            kline,
            simulate: false,
        }
    }

    pub fn with_simulation(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    /// Push the signal set of one strategy to its subscribers; returns the
    /// number of clients reached.
    pub async fn publish_strategy_prices(&self, strategy: &str) -> ServiceResult<usize> {
        let subscribers = self
            .hub
            .subscriptions
            .subscribers(SubscriptionType::Strategy, strategy);
        if subscribers.is_empty() {
            debug!(strategy, "no subscribers, skipping push");
            return Ok(0);
        }

        let signals = self.engine.signals(Some(strategy)).await?;
        let updates: Vec<PriceUpdate> = signals
            .iter()
            .filter(|s| s.price > 0.0)
            .map(|s| self.update_from_signal(s))
            .collect();
        if updates.is_empty() {
            debug!(strategy, "no price updates to push");
            return Ok(0);
        }

        let message = PriceUpdateMessage::new(updates);
        let mut reached = 0usize;
        for client_id in &subscribers {
            if self.hub.connections.send_json(client_id, &message) {
                reached += 1;
            }
        }
        info!(
            strategy,
            updates = message.count,
            clients = reached,
            "strategy price push complete"
        );
        Ok(reached)
    }

    /// Push prices for a set of stock codes, one merged message per
    /// subscribed client.
    pub async fn publish_stock_prices(&self, codes: &[String]) -> ServiceResult<usize> {
        if codes.is_empty() {
            return Ok(0);
        }

        // client -> codes it subscribes to, restricted to this batch.
        let mut per_client: HashMap<String, Vec<&str>> = HashMap::new();
        for code in codes {
            for client_id in self
                .hub
                .subscriptions
                .subscribers(SubscriptionType::Stock, code)
            {
                per_client.entry(client_id).or_default().push(code);
            }
        }
        if per_client.is_empty() {
            return Ok(0);
        }

        // Resolve each distinct code once.
        let mut resolved: HashMap<&str, PriceUpdate> = HashMap::new();
        for code in codes {
            if resolved.contains_key(code.as_str()) {
                continue;
            }
            match self.stock_price_update(code).await {
                Ok(Some(update)) => {
                    resolved.insert(code, update);
                }
                Ok(None) => debug!(code, "no price data for stock push"),
                Err(e) => warn!(code, error = %e, "stock price lookup failed"),
            }
        }

        let mut reached = 0usize;
        for (client_id, client_codes) in per_client {
            let updates: Vec<PriceUpdate> = client_codes
                .iter()
                .filter_map(|code| resolved.get(*code).cloned())
                .collect();
            if updates.is_empty() {
                continue;
            }
            if self
                .hub
                .connections
                .send_json(&client_id, &PriceUpdateMessage::new(updates))
            {
                reached += 1;
            }
        }
        Ok(reached)
    }

    /// Notify one strategy's subscribers that its signal set changed.
    /// `action` is `add` or `remove`; the payload carries the full records.
    pub async fn publish_signal_updates(
        &self,
        strategy: &str,
        action: &str,
        signals: &[SignalRecord],
    ) -> ServiceResult<usize> {
        let subscribers = self
            .hub
            .subscriptions
            .subscribers(SubscriptionType::Strategy, strategy);
        if subscribers.is_empty() || signals.is_empty() {
            return Ok(0);
        }

        let data: Vec<serde_json::Value> = signals
            .iter()
            .filter_map(|s| serde_json::to_value(s).ok())
            .collect();
        let message = SignalUpdateMessage::new(action, data);

        let mut reached = 0usize;
        for client_id in &subscribers {
            if self.hub.connections.send_json(client_id, &message) {
                reached += 1;
            }
        }
        info!(strategy, action, clients = reached, "signal update push complete");
        Ok(reached)
    }

    /// Push every target that currently has at least one subscriber.
    pub async fn broadcast_all_active(&self) -> ServiceResult<usize> {
        let mut reached = 0usize;

        for strategy in self.hub.subscriptions.targets_of(SubscriptionType::Strategy) {
            reached += self.publish_strategy_prices(&strategy).await?;
        }

        let stocks = self.hub.subscriptions.targets_of(SubscriptionType::Stock);
        if !stocks.is_empty() {
            reached += self.publish_stock_prices(&stocks).await?;
        }

        Ok(reached)
    }

    fn update_from_signal(&self, signal: &SignalRecord) -> PriceUpdate {
        let (price, change, change_percent) =
            self.apply_walk(signal.price, signal.change_percent);
        PriceUpdate {
            code: signal.code.clone(),
            name: Some(signal.name.clone()),
            price,
            change,
            change_percent,
            volume: Some(signal.volume as i64),
            timestamp: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        }
    }

    /// Price for a plain stock subscription: the signal set first, the
    /// stored last bar otherwise.
    async fn stock_price_update(&self, code: &str) -> ServiceResult<Option<PriceUpdate>> {
        if let Some(signal) = self
            .engine
            .signals(None)
            .await?
            .into_iter()
            .find(|s| s.code == code && s.price > 0.0)
        {
            return Ok(Some(self.update_from_signal(&signal)));
        }

        let Some(ts_code) = ts_code_for(code) else {
            return Ok(None);
        };
        let Some(series) = self.kline.get(&ts_code).await? else {
            return Ok(None);
        };
        let Some(last) = series.data.last() else {
            return Ok(None);
        };

        let (price, change, change_percent) = self.apply_walk(last.close, last.pct_chg);
        Ok(Some(PriceUpdate {
            code: code.to_string(),
            name: None,
            price,
            change,
            change_percent,
            volume: Some(last.vol as i64),
            timestamp: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        }))
    }

    /// In test mode, walk the price by ±0.20–0.69 and recompute the change
    /// against the implied previous close.
    fn apply_walk(&self, base_price: f64, base_change_percent: f64) -> (f64, f64, f64) {
        if !self.simulate {
            return (round2(base_price), 0.0, round2(base_change_percent));
        }

        let mut rng = rand::thread_rng();
        let mut step = rng.gen_range(0.20..=0.69);
        if rng.gen_bool(0.5) {
            step = -step;
        }
        let price = base_price + step;

        let pre_close = if base_change_percent != 0.0 {
            base_price / (1.0 + base_change_percent / 100.0)
        } else {
            base_price
        };
        let change_percent = if pre_close > 0.0 {
            (price - pre_close) / pre_close * 100.0
        } else {
            base_change_percent
        };

        (round2(price), round2(step), round2(change_percent))
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Bar;
    use crate::store::kv::{self, KvStore, MemoryKv};
    use crate::store::keys;
    use crate::types::SignalType;
    use axum::extract::ws::Message;

    async fn setup() -> (Arc<WsHub>, PricePublisher) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let kline = Arc::new(KlineStore::new(kv.clone()));
        let engine = Arc::new(StrategyEngine::new(kv.clone(), kline.clone()));
        let hub = Arc::new(WsHub::new());

        // A stored volume_wave signal for 600519 and a bare series for
        // 000001 (stock-subscription fallback path).
        let signal = SignalRecord {
            code: "600519".into(),
            name: "贵州茅台".into(),
            market: "SH".into(),
            strategy: "volume_wave".into(),
            signal_type: SignalType::Buy,
            price: 1850.5,
            change_percent: 2.5,
            volume: 12_345_678.0,
            signal_date: "2025-06-02".into(),
            calculated_time: "2025-06-02T10:00:00".into(),
            stop_loss: None,
            take_profit: None,
            reason: None,
        };
        kv::hset_json(kv.as_ref(), keys::BUY_SIGNALS, "600519:volume_wave", &signal)
            .await
            .unwrap();

        let bars: Vec<Bar> = (1..=25)
            .map(|d| Bar {
                trade_date: format!("2025-05-{d:02}"),
                open: 11.0,
                high: 11.5,
                low: 10.8,
                close: 11.25,
                vol: 98_765.0,
                amount: 1.1e6,
                pct_chg: 1.35,
                change: 0.15,
            })
            .collect();
        kline.put("000001.SZ", bars, "tushare").await.unwrap();

        let publisher = PricePublisher::new(hub.clone(), engine, kline);
        (hub, publisher)
    }

    fn text_frames(rx: &mut tokio::sync::mpsc::Receiver<Message>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn strategy_and_stock_routing() {
        let (hub, publisher) = setup().await;

        let mut rx1 = hub.connections.register("c1");
        let mut rx2 = hub.connections.register("c2");
        let mut rx3 = hub.connections.register("c3");
        hub.subscriptions
            .subscribe("c1", SubscriptionType::Strategy, "volume_wave");
        hub.subscriptions
            .subscribe("c2", SubscriptionType::Stock, "600519");

        let reached = publisher.publish_strategy_prices("volume_wave").await.unwrap();
        assert_eq!(reached, 1);
        let reached = publisher
            .publish_stock_prices(&["600519".to_string()])
            .await
            .unwrap();
        assert_eq!(reached, 1);

        let c1 = text_frames(&mut rx1);
        assert_eq!(c1.len(), 1);
        assert_eq!(c1[0]["type"], "price_update");
        assert_eq!(c1[0]["data"][0]["code"], "600519");
        assert_eq!(c1[0]["data"][0]["price"], 1850.5);

        let c2 = text_frames(&mut rx2);
        assert_eq!(c2.len(), 1);
        assert_eq!(c2[0]["data"][0]["code"], "600519");

        // The unrelated client receives nothing.
        assert!(text_frames(&mut rx3).is_empty());
    }

    #[tokio::test]
    async fn stock_push_falls_back_to_kline() {
        let (hub, publisher) = setup().await;
        let mut rx = hub.connections.register("c1");
        hub.subscriptions
            .subscribe("c1", SubscriptionType::Stock, "000001");

        let reached = publisher
            .publish_stock_prices(&["000001".to_string()])
            .await
            .unwrap();
        assert_eq!(reached, 1);

        let frames = text_frames(&mut rx);
        assert_eq!(frames[0]["data"][0]["code"], "000001");
        assert_eq!(frames[0]["data"][0]["price"], 11.25);
        assert_eq!(frames[0]["data"][0]["change_percent"], 1.35);
    }

    #[tokio::test]
    async fn merged_message_per_client() {
        let (hub, publisher) = setup().await;
        let mut rx = hub.connections.register("c1");
        hub.subscriptions
            .subscribe("c1", SubscriptionType::Stock, "600519");
        hub.subscriptions
            .subscribe("c1", SubscriptionType::Stock, "000001");

        let reached = publisher
            .publish_stock_prices(&["600519".to_string(), "000001".to_string()])
            .await
            .unwrap();
        assert_eq!(reached, 1);

        // One merged frame carrying both codes, not one frame per code.
        let frames = text_frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["count"], 2);
    }

    #[tokio::test]
    async fn broadcast_all_active_covers_both_kinds() {
        let (hub, publisher) = setup().await;
        let mut rx1 = hub.connections.register("c1");
        let mut rx2 = hub.connections.register("c2");
        hub.subscriptions
            .subscribe("c1", SubscriptionType::Strategy, "volume_wave");
        hub.subscriptions
            .subscribe("c2", SubscriptionType::Stock, "000001");

        let reached = publisher.broadcast_all_active().await.unwrap();
        assert_eq!(reached, 2);
        assert_eq!(text_frames(&mut rx1).len(), 1);
        assert_eq!(text_frames(&mut rx2).len(), 1);
    }

    #[tokio::test]
    async fn signal_update_push() {
        let (hub, publisher) = setup().await;
        let mut rx = hub.connections.register("c1");
        hub.subscriptions
            .subscribe("c1", SubscriptionType::Strategy, "volume_wave");

        let signals = publisher.engine.signals(Some("volume_wave")).await.unwrap();
        let reached = publisher
            .publish_signal_updates("volume_wave", "add", &signals)
            .await
            .unwrap();
        assert_eq!(reached, 1);

        let frames = text_frames(&mut rx);
        assert_eq!(frames[0]["type"], "signal_update");
        assert_eq!(frames[0]["action"], "add");
        assert_eq!(frames[0]["count"], 1);
        assert_eq!(frames[0]["data"][0]["code"], "600519");
    }

    #[tokio::test]
    async fn no_subscribers_no_pushes() {
        let (_hub, publisher) = setup().await;
        assert_eq!(
            publisher.publish_strategy_prices("volume_wave").await.unwrap(),
            0
        );
        assert_eq!(publisher.broadcast_all_active().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn simulated_walk_stays_bounded() {
        let (hub, publisher) = setup().await;
        let publisher = PricePublisher {
            simulate: true,
            ..publisher
        };
        let mut rx = hub.connections.register("c1");
        hub.subscriptions
            .subscribe("c1", SubscriptionType::Strategy, "volume_wave");

        for _ in 0..20 {
            publisher.publish_strategy_prices("volume_wave").await.unwrap();
            for frame in text_frames(&mut rx) {
                let price = frame["data"][0]["price"].as_f64().unwrap();
                let delta = (price - 1850.5).abs();
                assert!(
                    (0.20..=0.70).contains(&delta),
                    "walk out of bounds: {delta}"
                );
            }
        }
    }
}
