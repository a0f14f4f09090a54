mod common;

use std::sync::Arc;

use anyhow::Context;
use campus_trade::config::MarketConfig;
use campus_trade::market::{ItemState, Member};
use campus_trade::notify::{NotificationQuery, NotificationSender, OutgoingNotification};
use campus_trade::pipeline::{Checkpoint, FnHandler, Signal};
use campus_trade::rbac::RoleSpec;
use campus_trade::service::{ConfirmationPolicy, TradeService, TradeSettings};
use campus_trade::trade::{CancelReason, TradeState};

use common::{market, market_with, market_with_settings};

#[tokio::test]
async fn start_accept_confirm_trade() -> anyhow::Result<()> {
    let market = market()?;
    let (seller, seller_actor) = market.member()?;
    let (buyer, buyer_actor) = market.member()?;
    let item = market.item_of(&seller)?;

    let trade = market
        .service
        .start(&buyer_actor, &item.item_id)
        .await
        .context("Trade failed on start: ")?;
    assert_eq!(trade.state, TradeState::Pending);
    assert_eq!(trade.seller_id, seller.user_id);
    assert!(trade.accepted_time.is_none());

    let trade = market
        .service
        .accept(&seller_actor, &trade.trade_id)
        .await
        .context("Trade failed on accept: ")?;
    assert_eq!(trade.state, TradeState::Processing);
    assert!(trade.accepted_time.is_some());

    // first side confirms, dual-sided policy keeps it processing
    let trade = market.service.confirm(&buyer_actor, &trade.trade_id).await?;
    assert_eq!(trade.state, TradeState::Processing);
    assert!(trade.confirmed_time.is_some());
    assert!(trade.completed_time.is_none());

    let trade = market.service.confirm(&seller_actor, &trade.trade_id).await?;
    assert_eq!(trade.state, TradeState::Success);
    assert!(trade.completed_time.is_some());
    assert_eq!(trade.cancel_reason, None);

    assert_eq!(market.store.get_item(&item.item_id)?.state, ItemState::Sold);
    assert_eq!(market.service.get_trade(&trade.trade_id)?, trade);
    assert_eq!(market.service.trades_of_buyer(&buyer.user_id)?, vec![trade]);

    Ok(())
}

#[tokio::test]
async fn single_sided_confirmation_completes() -> anyhow::Result<()> {
    let market = market_with_settings(TradeSettings {
        confirmation: ConfirmationPolicy::SingleSided,
        ..TradeSettings::default()
    })?;
    let (seller, seller_actor) = market.member()?;
    let (_, buyer_actor) = market.member()?;
    let item = market.item_of(&seller)?;

    let trade = market.service.start(&buyer_actor, &item.item_id).await?;
    market.service.accept(&seller_actor, &trade.trade_id).await?;
    let trade = market.service.confirm(&buyer_actor, &trade.trade_id).await?;

    assert_eq!(trade.state, TradeState::Success);
    assert!(trade.buyer_confirmed_time.is_some());
    assert!(trade.seller_confirmed_time.is_none());

    Ok(())
}

#[tokio::test]
async fn seller_can_not_buy_own_item() -> anyhow::Result<()> {
    let market = market()?;
    let (seller, seller_actor) = market.member()?;
    let item = market.item_of(&seller)?;
    market.store.set_item_state(&item.item_id, ItemState::Hidden)?;

    let err = market
        .service
        .start(&seller_actor, &item.item_id)
        .await
        .unwrap_err();

    // self trade is reported even though the item is also hidden
    assert_eq!(err.name(), "identical_seller_buyer");
    assert!(market.service.trades_for_item(&item.item_id)?.is_empty());

    Ok(())
}

#[tokio::test]
async fn self_trade_is_reported_before_missing_member() -> anyhow::Result<()> {
    let market = market()?;
    // a seller whose member record was never stored
    let seller = Member::new("user_unregistered".into()).with_role("member");
    let seller_actor = market.actor_for(&seller);
    let item = market.item_of(&seller)?;

    let err = market
        .service
        .start(&seller_actor, &item.item_id)
        .await
        .unwrap_err();
    assert_eq!(err.name(), "identical_seller_buyer");

    Ok(())
}

#[tokio::test]
async fn duplicate_negotiation_is_rejected() -> anyhow::Result<()> {
    let market = market()?;
    let (seller, _) = market.member()?;
    let (_, buyer_actor) = market.member()?;
    let item = market.item_of(&seller)?;

    let first = market.service.start(&buyer_actor, &item.item_id).await?;
    let err = market
        .service
        .start(&buyer_actor, &item.item_id)
        .await
        .unwrap_err();
    assert_eq!(err.name(), "duplicated_transaction");

    // once the first one is closed the buyer may try again
    market
        .service
        .cancel(&buyer_actor, &first.trade_id, None, true)
        .await?;
    let second = market.service.start(&buyer_actor, &item.item_id).await?;
    assert_ne!(first.trade_id, second.trade_id);

    Ok(())
}

#[tokio::test]
async fn only_one_trade_processes_per_item() -> anyhow::Result<()> {
    let market = market()?;
    let (seller, seller_actor) = market.member()?;
    let (_, alice) = market.member()?;
    let (_, bob) = market.member()?;
    let item = market.item_of(&seller)?;

    let a = market.service.start(&alice, &item.item_id).await?;
    let b = market.service.start(&bob, &item.item_id).await?;

    market.service.accept(&seller_actor, &a.trade_id).await?;
    let err = market
        .service
        .accept(&seller_actor, &b.trade_id)
        .await
        .unwrap_err();
    assert_eq!(err.name(), "processing_transaction_exists");
    assert_eq!(market.service.get_trade(&b.trade_id)?.state, TradeState::Pending);

    // a third buyer can not even start while a trade is processing
    let (_, carol) = market.member()?;
    let err = market.service.start(&carol, &item.item_id).await.unwrap_err();
    assert_eq!(err.name(), "processing_transaction_exists");

    // cancelling the processing trade frees the item for b
    market
        .service
        .cancel(&seller_actor, &a.trade_id, None, true)
        .await?;
    let b = market.service.accept(&seller_actor, &b.trade_id).await?;
    assert_eq!(b.state, TradeState::Processing);

    Ok(())
}

#[tokio::test]
async fn only_the_seller_accepts() -> anyhow::Result<()> {
    let market = market()?;
    let (seller, _) = market.member()?;
    let (_, buyer_actor) = market.member()?;
    let item = market.item_of(&seller)?;

    let trade = market.service.start(&buyer_actor, &item.item_id).await?;
    let err = market
        .service
        .accept(&buyer_actor, &trade.trade_id)
        .await
        .unwrap_err();

    assert_eq!(err.name(), "not_seller");
    assert_eq!(err.violation().map(|v| v.status()), Some(403));

    Ok(())
}

#[tokio::test]
async fn buyer_needs_contact_and_capacity() -> anyhow::Result<()> {
    let market = market_with_settings(TradeSettings {
        max_processing_per_buyer: 1,
        ..TradeSettings::default()
    })?;
    let (seller, seller_actor) = market.member()?;
    let first = market.item_of(&seller)?;
    let second = market.item_of(&seller)?;

    let silent = market.register(Member::new("user_silent".into()).with_role("member"))?;
    let err = market.service.start(&silent, &first.item_id).await.unwrap_err();
    assert_eq!(err.name(), "no_valid_contact_info");

    let (_, buyer_actor) = market.member()?;
    let trade = market.service.start(&buyer_actor, &first.item_id).await?;
    market.service.accept(&seller_actor, &trade.trade_id).await?;

    let err = market
        .service
        .start(&buyer_actor, &second.item_id)
        .await
        .unwrap_err();
    assert_eq!(err.name(), "processing_transaction_limit_exceeded");

    // finishing the processing trade frees capacity
    market
        .service
        .cancel(&buyer_actor, &trade.trade_id, None, true)
        .await?;
    market.service.start(&buyer_actor, &second.item_id).await?;

    Ok(())
}

#[tokio::test]
async fn cancel_reasons_are_derived() -> anyhow::Result<()> {
    let market = market()?;
    let (seller, seller_actor) = market.member()?;
    let (_, buyer_actor) = market.member()?;

    let cases = [
        (false, &seller_actor, CancelReason::SellerRejected),
        (false, &buyer_actor, CancelReason::CancelledByBuyer),
        (true, &seller_actor, CancelReason::CancelledBySeller),
        (true, &buyer_actor, CancelReason::CancelledByBuyer),
    ];

    for (accepted, canceller, expected) in cases {
        let item = market.item_of(&seller)?;
        let trade = market.service.start(&buyer_actor, &item.item_id).await?;
        if accepted {
            market.service.accept(&seller_actor, &trade.trade_id).await?;
        }

        let trade = market
            .service
            .cancel(canceller, &trade.trade_id, None, true)
            .await?;
        assert_eq!(trade.state, TradeState::Cancelled);
        assert_eq!(trade.cancel_reason, Some(expected));
        assert_eq!(trade.accepted_time.is_some(), accepted);
    }

    Ok(())
}

#[tokio::test]
async fn cancel_rules() -> anyhow::Result<()> {
    let market = market()?;
    let (seller, seller_actor) = market.member()?;
    let (_, buyer_actor) = market.member()?;
    let (_, stranger) = market.member()?;
    let item = market.item_of(&seller)?;

    let trade = market.service.start(&buyer_actor, &item.item_id).await?;
    market.service.accept(&seller_actor, &trade.trade_id).await?;

    let err = market
        .service
        .cancel(&stranger, &trade.trade_id, None, true)
        .await
        .unwrap_err();
    assert_eq!(err.name(), "could_not_determine_cancel_reason");

    market.service.confirm(&buyer_actor, &trade.trade_id).await?;
    let err = market
        .service
        .cancel(&seller_actor, &trade.trade_id, None, true)
        .await
        .unwrap_err();
    assert_eq!(err.name(), "could_not_cancel_confirmed_transaction");

    // a sweep job may still cancel with an explicit reason
    let trade = market
        .service
        .cancel(
            &stranger,
            &trade.trade_id,
            Some(CancelReason::SellerConfirmTimeout),
            false,
        )
        .await?;
    assert_eq!(trade.cancel_reason, Some(CancelReason::SellerConfirmTimeout));

    let err = market
        .service
        .cancel(&buyer_actor, &trade.trade_id, None, false)
        .await
        .unwrap_err();
    assert_eq!(err.name(), "transaction_closed");

    // the item is free again
    assert!(market.service.trades_for_item(&item.item_id)?.len() == 1);
    let (_, other_buyer) = market.member()?;
    market.service.start(&other_buyer, &item.item_id).await?;

    Ok(())
}

#[tokio::test]
async fn success_is_final() -> anyhow::Result<()> {
    let market = market()?;
    let (seller, seller_actor) = market.member()?;
    let (_, buyer_actor) = market.member()?;
    let item = market.item_of(&seller)?;

    let trade = market.service.start(&buyer_actor, &item.item_id).await?;

    // no shortcut from pending to success
    let err = market
        .service
        .confirm(&buyer_actor, &trade.trade_id)
        .await
        .unwrap_err();
    assert_eq!(err.name(), "transaction_not_processing");

    market.service.accept(&seller_actor, &trade.trade_id).await?;
    market.service.confirm(&buyer_actor, &trade.trade_id).await?;
    let err = market
        .service
        .confirm(&buyer_actor, &trade.trade_id)
        .await
        .unwrap_err();
    assert_eq!(err.name(), "already_confirmed");
    market.service.confirm(&seller_actor, &trade.trade_id).await?;

    let err = market
        .service
        .cancel(&seller_actor, &trade.trade_id, None, false)
        .await
        .unwrap_err();
    assert_eq!(err.name(), "transaction_closed");

    // the sold item takes no new trades
    let (_, late) = market.member()?;
    let err = market.service.start(&late, &item.item_id).await.unwrap_err();
    assert_eq!(err.name(), "invalid_item");

    Ok(())
}

#[tokio::test]
async fn guests_can_not_trade() -> anyhow::Result<()> {
    let market = market()?;
    let (seller, _) = market.member()?;
    let item = market.item_of(&seller)?;

    let err = market
        .service
        .start(&market.guest(), &item.item_id)
        .await
        .unwrap_err();
    assert_eq!(err.name(), "insufficient_permission");

    // even when configuration hands guests the permission
    let mut config = MarketConfig::default();
    for role in config.roles.iter_mut() {
        if role.name == "guest" {
            role.grants.insert("trade:start".to_owned());
        }
    }
    let open_market = market_with(config, None)?;
    let item = open_market.item_of(&seller)?;
    let err = open_market
        .service
        .start(&open_market.guest(), &item.item_id)
        .await
        .unwrap_err();
    assert_eq!(err.name(), "anonymous_actor");

    Ok(())
}

#[tokio::test]
async fn unknown_role_is_reported() -> anyhow::Result<()> {
    let market = market()?;
    let (seller, _) = market.member()?;
    let item = market.item_of(&seller)?;

    let drifted = market.register(
        Member::new("user_drifted".into())
            .with_role("moderator")
            .with_contact(campus_trade::market::ContactKind::Phone, "555-0100"),
    )?;
    let err = market
        .service
        .start(&drifted, &item.item_id)
        .await
        .unwrap_err();
    assert_eq!(err.name(), "invalid_role");

    Ok(())
}

#[tokio::test]
async fn per_role_authorization_is_not_a_union() -> anyhow::Result<()> {
    let mut config = MarketConfig::default();
    config.roles.push(RoleSpec {
        name: "starter".into(),
        title: String::new(),
        grants: ["trade:start".to_owned()].into(),
        inherits: Default::default(),
    });
    config.roles.push(RoleSpec {
        name: "acceptor".into(),
        title: String::new(),
        grants: ["trade:accept".to_owned()].into(),
        inherits: Default::default(),
    });
    let market = market_with(config, None)?;
    let required = campus_trade::rbac::permission_set(["trade:start", "trade:accept"]);
    let roles = campus_trade::rbac::permission_set(["starter", "acceptor"]);

    assert!(market.permissions.authorize(&roles, &required).is_err());
    assert!(market
        .permissions
        .authorize(&roles, &campus_trade::rbac::permission_set(["trade:start"]))
        .is_ok());

    Ok(())
}

#[tokio::test]
async fn archived_trades_disappear_and_free_slots() -> anyhow::Result<()> {
    let market = market()?;
    let (seller, seller_actor) = market.member()?;
    let (buyer, buyer_actor) = market.member()?;
    let (_, other_actor) = market.member()?;
    let first = market.item_of(&seller)?;
    let second = market.item_of(&seller)?;

    let processing = market.service.start(&buyer_actor, &first.item_id).await?;
    market.service.accept(&seller_actor, &processing.trade_id).await?;
    market.service.start(&buyer_actor, &second.item_id).await?;
    let untouched = market.service.start(&other_actor, &second.item_id).await?;

    let info = market
        .service
        .archive_trades_of_buyers(&[buyer.user_id.as_str()])?;
    assert_eq!(info.count, 2);

    assert!(market.service.trades_of_buyer(&buyer.user_id)?.is_empty());
    assert_eq!(market.service.trades_for_item(&second.item_id)?, vec![untouched]);
    let err = market.service.get_trade(&processing.trade_id).unwrap_err();
    assert_eq!(err.name(), "no_result");

    // the first item no longer has a processing trade
    let trade = market.service.start(&other_actor, &first.item_id).await?;
    market.service.accept(&seller_actor, &trade.trade_id).await?;

    // archiving twice is a no-op
    let info = market
        .service
        .archive_trades_of_buyers(&[buyer.user_id.as_str()])?;
    assert_eq!(info.count, 0);

    Ok(())
}

#[tokio::test]
async fn queries_list_newest_first() -> anyhow::Result<()> {
    let market = market()?;
    let (seller, _) = market.member()?;
    let (buyer, buyer_actor) = market.member()?;
    let (_, other_actor) = market.member()?;
    let first = market.item_of(&seller)?;
    let second = market.item_of(&seller)?;
    let third = market.item_of(&seller)?;

    let a = market.service.start(&buyer_actor, &first.item_id).await?;
    let b = market.service.start(&buyer_actor, &second.item_id).await?;
    let c = market.service.start(&buyer_actor, &third.item_id).await?;
    assert_eq!(market.service.trades_of_buyer(&buyer.user_id)?, vec![c, b.clone(), a]);

    let d = market.service.start(&other_actor, &second.item_id).await?;
    assert_eq!(market.service.trades_for_item(&second.item_id)?, vec![d, b]);

    Ok(())
}

#[tokio::test]
async fn notifier_veto_does_not_undo_transitions() -> anyhow::Result<()> {
    let market = market()?;
    let mut notifier = NotificationSender::with_default_handlers(market.store.clone(), true)?;
    notifier.pipeline_mut().add(
        Checkpoint::Before,
        "do-not-disturb",
        FnHandler::new(|_: &mut OutgoingNotification| Ok(Signal::Abort("quiet hours".into()))),
    )?;
    let notifying = TradeService::new(
        market.store.clone(),
        market.permissions.clone(),
        market.config.trade.clone(),
    )
    .with_notifier(Arc::new(notifier));

    let (seller, seller_actor) = market.member()?;
    let (buyer, buyer_actor) = market.member()?;
    let item = market.item_of(&seller)?;

    let trade = notifying.start(&buyer_actor, &item.item_id).await?;
    let accepted = notifying.accept(&seller_actor, &trade.trade_id).await?;
    assert_eq!(accepted.state, TradeState::Processing);
    assert_eq!(market.service.get_trade(&trade.trade_id)?, accepted);

    let reader = NotificationSender::new(market.store.clone(), false);
    assert!(
        reader
            .notifications_of(&seller.user_id, NotificationQuery::default())?
            .is_empty()
    );
    assert!(
        reader
            .notifications_of(&buyer.user_id, NotificationQuery::default())?
            .is_empty()
    );

    Ok(())
}

#[tokio::test]
async fn notifier_failure_does_not_undo_transitions() -> anyhow::Result<()> {
    let market = market()?;
    let notifier = NotificationSender::with_default_handlers(market.store.clone(), false)?;
    let notifying = TradeService::new(
        market.store.clone(),
        market.permissions.clone(),
        market.config.trade.clone(),
    )
    .with_notifier(Arc::new(notifier));

    // no member record, so the companion notification fails validation
    let seller = Member::new("user_gone".into()).with_role("member");
    let (_, buyer_actor) = market.member()?;
    let item = market.item_of(&seller)?;

    let trade = notifying.start(&buyer_actor, &item.item_id).await?;
    assert_eq!(trade.state, TradeState::Pending);
    assert_eq!(market.service.get_trade(&trade.trade_id)?, trade);

    Ok(())
}

#[tokio::test]
async fn transitions_notify_the_counterpart() -> anyhow::Result<()> {
    let market = market()?;
    let notifier = NotificationSender::with_default_handlers(market.store.clone(), true)?;
    let notifying = TradeService::new(
        market.store.clone(),
        market.permissions.clone(),
        market.config.trade.clone(),
    )
    .with_notifier(Arc::new(notifier));

    let (seller, seller_actor) = market.member()?;
    let (buyer, buyer_actor) = market.member()?;
    let item = market.item_of(&seller)?;

    let trade = notifying.start(&buyer_actor, &item.item_id).await?;
    notifying.accept(&seller_actor, &trade.trade_id).await?;

    let reader = NotificationSender::new(market.store.clone(), false);
    let to_seller = reader.notifications_of(&seller.user_id, NotificationQuery::default())?;
    let to_buyer = reader.notifications_of(&buyer.user_id, NotificationQuery::default())?;

    assert_eq!(to_seller.len(), 1);
    assert_eq!(to_seller[0].sender_id.as_deref(), Some(buyer.user_id.as_str()));
    assert_eq!(to_seller[0].content.trade_id.as_deref(), Some(trade.trade_id.as_str()));
    assert_eq!(to_buyer.len(), 1);

    Ok(())
}
