use super::*;
use chrono::{DateTime, NaiveDate, TimeDelta, TimeZone, Utc};
use chrono_tz::America::Sao_Paulo;
use rust_decimal::Decimal;

// ── Fixture ──────────────────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("agenda_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// 2024-05-10 at `h:m` in São Paulo (UTC-3, no DST that year).
fn at(h: u32, m: u32) -> Instant {
    Sao_Paulo
        .with_ymd_and_hms(2024, 5, 10, h, m, 0)
        .unwrap()
        .with_timezone(&Utc)
}

fn tenant_draft(name: &str) -> TenantDraft {
    TenantDraft {
        name: name.into(),
        contact: Contact::default(),
        timezone: Sao_Paulo,
        default_duration_minutes: None,
    }
}

fn service_draft(name: &str, minutes: Option<u32>) -> ServiceDraft {
    ServiceDraft {
        name: name.into(),
        price: Decimal::new(3550, 2),
        duration_minutes: minutes,
        description: None,
    }
}

/// One tenant with one client, a 30-minute haircut and a 90-minute coloring.
struct Shop {
    engine: Arc<Engine>,
    tenant: TenantId,
    client: ClientId,
    haircut: ServiceId,
    coloring: ServiceId,
}

impl Shop {
    async fn open(wal: &str) -> Self {
        Self::open_with(wal, SchedulingPolicy::default()).await
    }

    async fn open_with(wal: &str, policy: SchedulingPolicy) -> Self {
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(test_wal_path(wal), notify, policy).unwrap());
        let tenant = Ulid::new();
        engine.register_tenant(tenant, tenant_draft("Salão Bela Vista")).await.unwrap();
        let client = Ulid::new();
        let maria = ClientDraft {
            name: "Maria".into(),
            ..Default::default()
        };
        engine.create_client(tenant, client, maria).await.unwrap();
        let haircut = Ulid::new();
        engine
            .create_service(tenant, haircut, service_draft("Corte", Some(30)))
            .await
            .unwrap();
        let coloring = Ulid::new();
        engine
            .create_service(tenant, coloring, service_draft("Coloração", Some(90)))
            .await
            .unwrap();
        Self {
            engine,
            tenant,
            client,
            haircut,
            coloring,
        }
    }

    async fn book(&self, service: ServiceId, start: Instant) -> Result<Appointment, EngineError> {
        self.engine
            .create_appointment(
                self.tenant,
                NewAppointment {
                    id: Ulid::new(),
                    client_id: self.client,
                    service_id: service,
                    start,
                    notes: None,
                },
            )
            .await
    }
}

// ── Booking and conflicts ────────────────────────────────

#[tokio::test]
async fn back_to_back_is_not_a_conflict() {
    let shop = Shop::open("back_to_back.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();
    assert_eq!(a.span, Span::new(at(9, 0), at(9, 30)));
    assert_eq!(a.status, AppointmentStatus::Open);

    let b = shop.book(shop.haircut, at(9, 30)).await.unwrap();
    assert_eq!(b.span, Span::new(at(9, 30), at(10, 0)));
}

#[tokio::test]
async fn overlap_is_rejected_citing_the_existing_appointment() {
    let shop = Shop::open("overlap_cites.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();

    match shop.book(shop.haircut, at(9, 29)).await {
        Err(EngineError::SlotConflict { requested, conflicts }) => {
            assert_eq!(requested, Span::new(at(9, 29), at(9, 59)));
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].id, a.id);
        }
        other => panic!("expected SlotConflict, got {other:?}"),
    }
    assert_eq!(shop.engine.list_appointments(shop.tenant, &AppointmentFilter::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn conflict_reports_every_overlap_in_start_order() {
    let shop = Shop::open("conflict_all.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();
    let b = shop.book(shop.haircut, at(9, 30)).await.unwrap();
    let c = shop.book(shop.haircut, at(10, 0)).await.unwrap();

    let err = shop.book(shop.coloring, at(9, 15)).await.unwrap_err();
    let EngineError::SlotConflict { conflicts, .. } = err else {
        panic!("expected SlotConflict, got {err:?}");
    };
    let ids: Vec<_> = conflicts.iter().map(|x| x.id).collect();
    assert_eq!(ids, vec![a.id, b.id, c.id]);
}

#[tokio::test]
async fn long_booking_far_back_is_still_seen() {
    let shop = Shop::open("lookback.wal").await;
    // 08:00-09:30 coloring, then a short booking inside it must collide
    // even though it starts 75 minutes after the coloring.
    let long = shop.book(shop.coloring, at(8, 0)).await.unwrap();
    let err = shop.book(shop.haircut, at(9, 15)).await.unwrap_err();
    let EngineError::SlotConflict { conflicts, .. } = err else {
        panic!("expected SlotConflict, got {err:?}");
    };
    assert_eq!(conflicts[0].id, long.id);
}

#[tokio::test]
async fn cancelled_slot_can_be_rebooked() {
    let shop = Shop::open("cancel_rebook.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();
    shop.engine.cancel(shop.tenant, a.id).await.unwrap();

    let b = shop.book(shop.haircut, at(9, 0)).await.unwrap();
    assert_eq!(b.span, a.span);
    let cancelled = shop.engine.get_appointment(shop.tenant, a.id).await.unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
}

#[tokio::test]
async fn concurrent_overlapping_creates_exactly_one_wins() {
    let shop = Shop::open("concurrent.wal").await;
    let (first, second) = tokio::join!(shop.book(shop.haircut, at(9, 0)), shop.book(shop.haircut, at(9, 15)));

    let results = [first, second];
    let won = results.iter().filter(|r| r.is_ok()).count();
    let conflicted = results
        .iter()
        .filter(|r| matches!(r, Err(EngineError::SlotConflict { .. })))
        .count();
    assert_eq!((won, conflicted), (1, 1));
}

#[tokio::test]
async fn concurrent_creates_across_tasks_never_overlap() {
    let shop = Shop::open("concurrent_tasks.wal").await;
    let mut handles = Vec::new();
    for i in 0..20u32 {
        let engine = shop.engine.clone();
        let (tenant, client, service) = (shop.tenant, shop.client, shop.haircut);
        // Starts every 10 minutes: each 30-minute booking overlaps its neighbours.
        let start = at(9, 0) + TimeDelta::minutes(10 * i as i64);
        handles.push(tokio::spawn(async move {
            let new = NewAppointment {
                id: Ulid::new(),
                client_id: client,
                service_id: service,
                start,
                notes: None,
            };
            engine.create_appointment(tenant, new).await
        }));
    }
    for h in handles {
        match h.await.unwrap() {
            Ok(_) | Err(EngineError::SlotConflict { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    let booked = shop
        .engine
        .list_appointments(shop.tenant, &AppointmentFilter::default())
        .await
        .unwrap();
    assert!(!booked.is_empty());
    for pair in booked.windows(2) {
        assert!(pair[0].span.end <= pair[1].span.start, "{} overlaps {}", pair[0].span, pair[1].span);
    }
}

// ── Editing ──────────────────────────────────────────────

#[tokio::test]
async fn longer_service_conflicts_with_next_appointment() {
    let shop = Shop::open("longer_service.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();
    let b = shop.book(shop.haircut, at(9, 30)).await.unwrap();

    let err = shop.engine.change_service(shop.tenant, a.id, shop.coloring).await.unwrap_err();
    let EngineError::SlotConflict { conflicts, .. } = err else {
        panic!("expected SlotConflict, got {err:?}");
    };
    assert_eq!(conflicts[0].id, b.id);

    // Unchanged after the rejection.
    let a_now = shop.engine.get_appointment(shop.tenant, a.id).await.unwrap();
    assert_eq!(a_now, a);
}

#[tokio::test]
async fn reschedule_keeps_duration_and_ignores_itself() {
    let shop = Shop::open("reschedule_self.wal").await;
    let a = shop.book(shop.coloring, at(9, 0)).await.unwrap();
    let moved = shop.engine.reschedule(shop.tenant, a.id, at(9, 20)).await.unwrap();
    assert_eq!(moved.span, Span::new(at(9, 20), at(10, 50)));
}

#[tokio::test]
async fn service_duration_change_does_not_move_bookings() {
    let shop = Shop::open("snapshot.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();
    shop.engine
        .update_service(shop.tenant, shop.haircut, service_draft("Corte", Some(60)))
        .await
        .unwrap();
    let a_now = shop.engine.get_appointment(shop.tenant, a.id).await.unwrap();
    assert_eq!(a_now.span, Span::new(at(9, 0), at(9, 30)));
    // A later reschedule also keeps the booked duration.
    let moved = shop.engine.reschedule(shop.tenant, a.id, at(11, 0)).await.unwrap();
    assert_eq!(moved.span, Span::new(at(11, 0), at(11, 30)));
}

#[tokio::test]
async fn edit_that_cancels_never_conflicts() {
    let shop = Shop::open("cancel_edit.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();
    shop.book(shop.haircut, at(10, 0)).await.unwrap();

    let patch = AppointmentPatch {
        start: Some(at(10, 0)),
        status: Some(AppointmentStatus::Cancelled),
        ..Default::default()
    };
    let edited = shop.engine.edit_appointment(shop.tenant, a.id, patch).await.unwrap();
    assert_eq!(edited.status, AppointmentStatus::Cancelled);
    assert_eq!(edited.span.start, at(10, 0));
}

#[tokio::test]
async fn edit_with_same_values_writes_nothing() {
    let shop = Shop::open("noop_edit.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();
    let before = shop.engine.wal_appends_since_compact().await;

    let patch = AppointmentPatch {
        start: Some(a.span.start),
        service_id: Some(a.service_id),
        status: Some(AppointmentStatus::Open),
        ..Default::default()
    };
    let same = shop.engine.edit_appointment(shop.tenant, a.id, patch).await.unwrap();
    assert_eq!(same, a);
    assert_eq!(shop.engine.wal_appends_since_compact().await, before);
}

#[tokio::test]
async fn client_and_notes_can_change() {
    let shop = Shop::open("client_notes.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();
    let joao = Ulid::new();
    let draft = ClientDraft {
        name: "João".into(),
        ..Default::default()
    };
    shop.engine.create_client(shop.tenant, joao, draft).await.unwrap();

    let a = shop.engine.change_client(shop.tenant, a.id, joao).await.unwrap();
    assert_eq!(a.client_id, joao);
    let a = shop
        .engine
        .update_notes(shop.tenant, a.id, Some("  trazer referência  ".into()))
        .await
        .unwrap();
    assert_eq!(a.notes.as_deref(), Some("trazer referência"));
    let a = shop.engine.update_notes(shop.tenant, a.id, None).await.unwrap();
    assert_eq!(a.notes, None);
}

// ── Status lifecycle ─────────────────────────────────────

#[tokio::test]
async fn cancel_twice_succeeds() {
    let shop = Shop::open("double_cancel.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();
    let first = shop.engine.cancel(shop.tenant, a.id).await.unwrap();
    let second = shop.engine.cancel(shop.tenant, a.id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(second.status, AppointmentStatus::Cancelled);
}

#[tokio::test]
async fn full_lifecycle_and_rejected_transitions() {
    let shop = Shop::open("lifecycle.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();

    let err = shop
        .engine
        .transition(shop.tenant, a.id, AppointmentStatus::Completed)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: AppointmentStatus::Open,
            to: AppointmentStatus::Completed,
            ..
        }
    ));
    let err = shop
        .engine
        .transition(shop.tenant, a.id, AppointmentStatus::Open)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    shop.engine
        .transition(shop.tenant, a.id, AppointmentStatus::InProgress)
        .await
        .unwrap();
    let done = shop
        .engine
        .transition(shop.tenant, a.id, AppointmentStatus::Completed)
        .await
        .unwrap();
    assert_eq!(done.status, AppointmentStatus::Completed);

    let err = shop.engine.cancel(shop.tenant, a.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: AppointmentStatus::Completed,
            to: AppointmentStatus::Cancelled,
            ..
        }
    ));
}

#[tokio::test]
async fn terminal_appointment_cannot_move_but_notes_can_change() {
    let shop = Shop::open("terminal_edit.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();
    shop.engine.cancel(shop.tenant, a.id).await.unwrap();

    let err = shop.engine.reschedule(shop.tenant, a.id, at(11, 0)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
    let err = shop.engine.change_service(shop.tenant, a.id, shop.coloring).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    let noted = shop
        .engine
        .update_notes(shop.tenant, a.id, Some("cliente desmarcou".into()))
        .await
        .unwrap();
    assert_eq!(noted.notes.as_deref(), Some("cliente desmarcou"));
}

#[tokio::test]
async fn completed_appointment_keeps_its_slot() {
    let shop = Shop::open("completed_slot.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();
    shop.engine.transition(shop.tenant, a.id, AppointmentStatus::InProgress).await.unwrap();
    shop.engine.transition(shop.tenant, a.id, AppointmentStatus::Completed).await.unwrap();
    assert!(matches!(
        shop.book(shop.haircut, at(9, 0)).await,
        Err(EngineError::SlotConflict { .. })
    ));
}

// ── Idempotency and validation ───────────────────────────

#[tokio::test]
async fn create_is_idempotent_on_identical_retry() {
    let shop = Shop::open("idempotent.wal").await;
    let request = NewAppointment {
        id: Ulid::new(),
        client_id: shop.client,
        service_id: shop.haircut,
        start: at(9, 0),
        notes: Some("primeira vez".into()),
    };
    let first = shop.engine.create_appointment(shop.tenant, request.clone()).await.unwrap();
    let retry = shop.engine.create_appointment(shop.tenant, request.clone()).await.unwrap();
    assert_eq!(first, retry);
    assert_eq!(shop.engine.list_appointments(shop.tenant, &AppointmentFilter::default()).await.unwrap().len(), 1);

    let different = NewAppointment {
        start: at(14, 0),
        ..request
    };
    assert!(matches!(
        shop.engine.create_appointment(shop.tenant, different).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn duration_falls_back_to_tenant_then_global_default() {
    let shop = Shop::open("duration_fallback.wal").await;
    let unknown = Ulid::new();
    shop.engine
        .create_service(shop.tenant, unknown, service_draft("Avaliação", None))
        .await
        .unwrap();

    assert!(matches!(
        shop.book(unknown, at(9, 0)).await,
        Err(EngineError::MissingDuration(id)) if id == unknown
    ));

    let draft = TenantDraft {
        default_duration_minutes: Some(45),
        ..tenant_draft("Salão Bela Vista")
    };
    shop.engine.update_tenant(shop.tenant, draft).await.unwrap();
    let a = shop.book(unknown, at(9, 0)).await.unwrap();
    assert_eq!(a.span, Span::new(at(9, 0), at(9, 45)));
}

#[tokio::test]
async fn global_default_duration_applies_last() {
    let policy = SchedulingPolicy {
        default_duration_minutes: Some(20),
        ..SchedulingPolicy::default()
    };
    let shop = Shop::open_with("duration_global.wal", policy).await;
    let unknown = Ulid::new();
    shop.engine
        .create_service(shop.tenant, unknown, service_draft("Avaliação", None))
        .await
        .unwrap();
    let a = shop.book(unknown, at(9, 0)).await.unwrap();
    assert_eq!(a.span.end, at(9, 20));
}

#[tokio::test]
async fn catalog_input_is_validated() {
    let shop = Shop::open("catalog_validation.wal").await;
    let blank = ClientDraft {
        name: "   ".into(),
        ..Default::default()
    };
    assert!(matches!(
        shop.engine.create_client(shop.tenant, Ulid::new(), blank).await,
        Err(EngineError::Invalid(_))
    ));

    let negative = ServiceDraft {
        price: Decimal::new(-100, 2),
        ..service_draft("Corte", Some(30))
    };
    assert!(matches!(
        shop.engine.create_service(shop.tenant, Ulid::new(), negative).await,
        Err(EngineError::Invalid(_))
    ));

    let zero = service_draft("Corte", Some(0));
    assert!(matches!(
        shop.engine.create_service(shop.tenant, Ulid::new(), zero).await,
        Err(EngineError::InvalidDuration(0))
    ));

    let precise = ServiceDraft {
        price: Decimal::new(35559, 3),
        ..service_draft("Escova", Some(40))
    };
    let service = shop.engine.create_service(shop.tenant, Ulid::new(), precise).await.unwrap();
    assert_eq!(service.price, Decimal::new(3556, 2));
}

// ── Tenant isolation and references ──────────────────────

#[tokio::test]
async fn other_tenants_catalog_is_a_cross_tenant_reference() {
    let shop = Shop::open("cross_tenant.wal").await;
    let other = Ulid::new();
    shop.engine.register_tenant(other, tenant_draft("Barbearia")).await.unwrap();
    let other_client = Ulid::new();
    let draft = ClientDraft {
        name: "Pedro".into(),
        ..Default::default()
    };
    shop.engine.create_client(other, other_client, draft).await.unwrap();

    let request = NewAppointment {
        id: Ulid::new(),
        client_id: other_client,
        service_id: shop.haircut,
        start: at(9, 0),
        notes: None,
    };
    match shop.engine.create_appointment(shop.tenant, request).await {
        Err(EngineError::CrossTenantReference { kind, id, tenant_id }) => {
            assert_eq!(kind, EntityKind::Client);
            assert_eq!(id, other_client);
            assert_eq!(tenant_id, shop.tenant);
        }
        other => panic!("expected CrossTenantReference, got {other:?}"),
    }

    let request = NewAppointment {
        id: Ulid::new(),
        client_id: shop.client,
        service_id: Ulid::new(),
        start: at(9, 0),
        notes: None,
    };
    assert!(matches!(
        shop.engine.create_appointment(shop.tenant, request).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn tenants_do_not_see_each_other() {
    let shop = Shop::open("isolation.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();

    let other = Ulid::new();
    shop.engine.register_tenant(other, tenant_draft("Barbearia")).await.unwrap();
    assert!(matches!(
        shop.engine.get_appointment(other, a.id).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(shop.engine.list_clients(other).await.unwrap().is_empty());
    let day = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
    assert!(shop.engine.list_day(other, day, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_is_blocked_by_live_appointments() {
    let shop = Shop::open("delete_block.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();

    match shop.engine.delete_client(shop.tenant, shop.client, DeletePolicy::Block).await {
        Err(EngineError::Referenced { kind, appointments, .. }) => {
            assert_eq!(kind, EntityKind::Client);
            assert_eq!(appointments, vec![a.id]);
        }
        other => panic!("expected Referenced, got {other:?}"),
    }
    assert!(shop.engine.get_client(shop.tenant, shop.client).await.is_ok());

    // Terminal appointments do not block.
    shop.engine.cancel(shop.tenant, a.id).await.unwrap();
    let cancelled = shop
        .engine
        .delete_client(shop.tenant, shop.client, DeletePolicy::Block)
        .await
        .unwrap();
    assert!(cancelled.is_empty());
    assert!(matches!(
        shop.engine.get_client(shop.tenant, shop.client).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn cascade_delete_cancels_then_removes() {
    let shop = Shop::open("delete_cascade.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();
    let b = shop.book(shop.coloring, at(10, 0)).await.unwrap();

    let cancelled = shop
        .engine
        .delete_service(shop.tenant, shop.haircut, DeletePolicy::Cascade)
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, a.id);

    let a_now = shop.engine.get_appointment(shop.tenant, a.id).await.unwrap();
    assert_eq!(a_now.status, AppointmentStatus::Cancelled);
    let b_now = shop.engine.get_appointment(shop.tenant, b.id).await.unwrap();
    assert_eq!(b_now.status, AppointmentStatus::Open);
    assert!(matches!(
        shop.engine.get_service(shop.tenant, shop.haircut).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn cascade_delete_is_one_wal_record() {
    let shop = Shop::open("delete_cascade_batch.wal").await;
    let mut booked = Vec::new();
    for hour in [9, 10, 11] {
        booked.push(shop.book(shop.haircut, at(hour, 0)).await.unwrap().id);
    }
    let mut rx = shop.engine.notify.subscribe(shop.tenant);

    let before = shop.engine.wal_appends_since_compact().await;
    let cancelled = shop
        .engine
        .delete_client(shop.tenant, shop.client, DeletePolicy::Cascade)
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 3);
    assert_eq!(shop.engine.wal_appends_since_compact().await, before + 1);

    for id in &booked {
        assert_eq!(rx.try_recv().unwrap().appointment_id, *id);
    }

    let path = test_wal_path_keep("delete_cascade_batch.wal");
    let reopened = Engine::new(path, Arc::new(NotifyHub::new()), SchedulingPolicy::default()).unwrap();
    assert!(reopened.list_clients(shop.tenant).await.unwrap().is_empty());
    for id in booked {
        let a = reopened.get_appointment(shop.tenant, id).await.unwrap();
        assert_eq!(a.status, AppointmentStatus::Cancelled);
    }
}

#[tokio::test]
async fn concurrent_partial_updates_both_land() {
    let shop = Shop::open("partial_updates.wal").await;
    let phone = shop.engine.modify_client(shop.tenant, shop.client, |draft| {
        draft.contact.phone = Some("+55 11 91234-5678".into());
    });
    let city = shop.engine.modify_client(shop.tenant, shop.client, |draft| {
        draft.address.city = Some("Campinas".into());
    });
    let (phone, city) = tokio::join!(phone, city);
    phone.unwrap();
    city.unwrap();

    let client = shop.engine.get_client(shop.tenant, shop.client).await.unwrap();
    assert_eq!(client.name, "Maria");
    assert_eq!(client.contact.phone.as_deref(), Some("+55 11 91234-5678"));
    assert_eq!(client.address.city.as_deref(), Some("Campinas"));

    let price = shop.engine.modify_service(shop.tenant, shop.haircut, |draft| {
        draft.price = Decimal::new(4000, 2);
    });
    let name = shop.engine.modify_service(shop.tenant, shop.haircut, |draft| {
        draft.name = "Corte masculino".into();
    });
    let (price, name) = tokio::join!(price, name);
    price.unwrap();
    name.unwrap();

    let service = shop.engine.get_service(shop.tenant, shop.haircut).await.unwrap();
    assert_eq!(service.name, "Corte masculino");
    assert_eq!(service.price, Decimal::new(4000, 2));
    assert_eq!(service.duration_minutes, Some(30));

    assert!(matches!(
        shop.engine.modify_client(shop.tenant, Ulid::new(), |_| {}).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn tenant_lifecycle() {
    let path = test_wal_path("tenant_lifecycle.wal");
    let engine = Engine::new(path, Arc::new(NotifyHub::new()), SchedulingPolicy::default()).unwrap();
    let id = Ulid::new();

    engine.register_tenant(id, tenant_draft("Estética Sol")).await.unwrap();
    // Identical registration is a no-op, a different one is refused.
    engine.register_tenant(id, tenant_draft("Estética Sol")).await.unwrap();
    assert!(matches!(
        engine.register_tenant(id, tenant_draft("Outra")).await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert_eq!(engine.list_tenants().await.unwrap().len(), 1);

    let client = Ulid::new();
    let draft = ClientDraft {
        name: "Ana".into(),
        ..Default::default()
    };
    engine.create_client(id, client, draft).await.unwrap();
    assert!(matches!(engine.remove_tenant(id).await, Err(EngineError::TenantNotEmpty(_))));

    engine.delete_client(id, client, DeletePolicy::Block).await.unwrap();
    engine.remove_tenant(id).await.unwrap();
    assert!(matches!(engine.get_tenant(id).await, Err(EngineError::NotFound(_))));
    assert!(engine.list_tenants().await.unwrap().is_empty());
}

// ── Day-window query ─────────────────────────────────────

#[tokio::test]
async fn list_day_uses_local_midnights() {
    let shop = Shop::open("list_day.wal").await;
    let prev_evening = Sao_Paulo
        .with_ymd_and_hms(2024, 5, 9, 23, 15, 0)
        .unwrap()
        .with_timezone(&Utc);
    let crossing = Sao_Paulo
        .with_ymd_and_hms(2024, 5, 9, 23, 45, 0)
        .unwrap()
        .with_timezone(&Utc);
    let next_morning = Sao_Paulo
        .with_ymd_and_hms(2024, 5, 11, 0, 0, 0)
        .unwrap()
        .with_timezone(&Utc);

    // 23:15-23:45 ends before midnight; 23:45-00:15 crosses into the day.
    shop.book(shop.haircut, prev_evening).await.unwrap();
    let across = shop.book(shop.haircut, crossing).await.unwrap();
    let late = shop.book(shop.haircut, at(18, 0)).await.unwrap();
    let early = shop.book(shop.haircut, at(8, 0)).await.unwrap();
    let cancelled = shop.book(shop.haircut, at(12, 0)).await.unwrap();
    shop.engine.cancel(shop.tenant, cancelled.id).await.unwrap();
    shop.book(shop.haircut, next_morning).await.unwrap();

    let day = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
    let listed = shop.engine.list_day(shop.tenant, day, None).await.unwrap();
    let ids: Vec<_> = listed.iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![across.id, early.id, cancelled.id, late.id]);
}

#[tokio::test]
async fn list_day_in_another_timezone() {
    let shop = Shop::open("list_day_tz.wal").await;
    // 22:00 in São Paulo is 01:00 UTC the next day.
    let a = shop.book(shop.haircut, at(22, 0)).await.unwrap();
    let may_10 = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
    let may_11 = NaiveDate::from_ymd_opt(2024, 5, 11).unwrap();

    assert_eq!(shop.engine.list_day(shop.tenant, may_10, None).await.unwrap().len(), 1);
    assert!(shop
        .engine
        .list_day(shop.tenant, may_10, Some(chrono_tz::UTC))
        .await
        .unwrap()
        .is_empty());
    let utc_day = shop.engine.list_day(shop.tenant, may_11, Some(chrono_tz::UTC)).await.unwrap();
    assert_eq!(utc_day[0].id, a.id);
}

#[tokio::test]
async fn list_appointments_filters_and_bounds_range() {
    let shop = Shop::open("list_filter.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();
    let b = shop.book(shop.coloring, at(10, 0)).await.unwrap();
    shop.engine.cancel(shop.tenant, a.id).await.unwrap();

    let open = AppointmentFilter {
        status: Some(AppointmentStatus::Open),
        ..Default::default()
    };
    let listed = shop.engine.list_appointments(shop.tenant, &open).await.unwrap();
    assert_eq!(listed.iter().map(|x| x.id).collect::<Vec<_>>(), vec![b.id]);

    let morning = AppointmentFilter {
        from: Some(at(8, 0)),
        to: Some(at(9, 45)),
        ..Default::default()
    };
    let listed = shop.engine.list_appointments(shop.tenant, &morning).await.unwrap();
    assert_eq!(listed.iter().map(|x| x.id).collect::<Vec<_>>(), vec![a.id]);

    let too_wide = AppointmentFilter {
        from: Some(at(0, 0)),
        to: Some(at(0, 0) + TimeDelta::days(400)),
        ..Default::default()
    };
    assert!(matches!(
        shop.engine.list_appointments(shop.tenant, &too_wide).await,
        Err(EngineError::LimitExceeded("query window too wide"))
    ));
}

#[tokio::test]
async fn list_appointments_rejects_out_of_range_bounds() {
    let shop = Shop::open("list_out_of_range.wal").await;
    shop.book(shop.haircut, at(9, 0)).await.unwrap();

    let min = DateTime::<Utc>::MIN_UTC;
    let ancient = AppointmentFilter {
        from: Some(min),
        to: Some(min + TimeDelta::hours(1)),
        ..Default::default()
    };
    assert!(matches!(
        shop.engine.list_appointments(shop.tenant, &ancient).await,
        Err(EngineError::LimitExceeded("timestamp out of range"))
    ));
}

#[tokio::test]
async fn preview_conflicts_without_booking() {
    let shop = Shop::open("preview.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();

    let clash = shop
        .engine
        .preview_conflicts(shop.tenant, shop.coloring, at(8, 0), None)
        .await
        .unwrap();
    assert_eq!(clash.iter().map(|x| x.id).collect::<Vec<_>>(), vec![a.id]);

    let own = shop
        .engine
        .preview_conflicts(shop.tenant, shop.haircut, at(9, 10), Some(a.id))
        .await
        .unwrap();
    assert!(own.is_empty());
    assert_eq!(shop.engine.list_appointments(shop.tenant, &AppointmentFilter::default()).await.unwrap().len(), 1);
}

// ── Notices ──────────────────────────────────────────────

#[tokio::test]
async fn mutations_publish_change_notices() {
    let shop = Shop::open("notices.wal").await;
    let mut rx = shop.engine.notify.subscribe(shop.tenant);

    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();
    shop.engine.reschedule(shop.tenant, a.id, at(10, 0)).await.unwrap();
    shop.engine.transition(shop.tenant, a.id, AppointmentStatus::InProgress).await.unwrap();
    shop.engine.cancel(shop.tenant, a.id).await.unwrap();

    let kinds: Vec<ChangeKind> = (0..4).map(|_| rx.try_recv().unwrap().change).collect();
    assert_eq!(
        kinds,
        vec![
            ChangeKind::Booked,
            ChangeKind::Edited,
            ChangeKind::StatusChanged,
            ChangeKind::Cancelled
        ]
    );
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn rejected_writes_publish_nothing() {
    let shop = Shop::open("notices_rejected.wal").await;
    shop.book(shop.haircut, at(9, 0)).await.unwrap();
    let mut rx = shop.engine.notify.subscribe(shop.tenant);
    assert!(shop.book(shop.haircut, at(9, 10)).await.is_err());
    assert!(rx.try_recv().is_err());
}

// ── Store availability ───────────────────────────────────

#[tokio::test]
async fn held_tenant_lock_gives_store_unavailable() {
    let policy = SchedulingPolicy {
        store_timeout: Duration::from_millis(30),
        store_retries: 1,
        ..SchedulingPolicy::default()
    };
    let shop = Shop::open_with("store_timeout.wal", policy).await;
    let state = shop.engine.tenant_state(&shop.tenant).unwrap();

    let guard = state.clone().write_owned().await;
    assert!(matches!(
        shop.book(shop.haircut, at(9, 0)).await,
        Err(EngineError::StoreUnavailable(_))
    ));
    drop(guard);

    // Nothing was written; the same slot books fine once the lock is free.
    shop.book(shop.haircut, at(9, 0)).await.unwrap();
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn replay_restores_everything() {
    let shop = Shop::open("replay.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();
    let b = shop.book(shop.coloring, at(10, 0)).await.unwrap();
    shop.engine.cancel(shop.tenant, a.id).await.unwrap();
    shop.engine.reschedule(shop.tenant, b.id, at(13, 0)).await.unwrap();

    let path = test_wal_path_keep("replay.wal");
    let reopened = Engine::new(path, Arc::new(NotifyHub::new()), SchedulingPolicy::default()).unwrap();

    assert_eq!(reopened.get_tenant(shop.tenant).await.unwrap().name, "Salão Bela Vista");
    assert_eq!(reopened.list_clients(shop.tenant).await.unwrap().len(), 1);
    assert_eq!(reopened.list_services(shop.tenant).await.unwrap().len(), 2);
    let all = reopened
        .list_appointments(shop.tenant, &AppointmentFilter::default())
        .await
        .unwrap();
    let original = shop
        .engine
        .list_appointments(shop.tenant, &AppointmentFilter::default())
        .await
        .unwrap();
    assert_eq!(all, original);

    // The replayed book still enforces the invariant.
    assert!(matches!(
        reopened
            .create_appointment(
                shop.tenant,
                NewAppointment {
                    id: Ulid::new(),
                    client_id: shop.client,
                    service_id: shop.haircut,
                    start: at(13, 30),
                    notes: None,
                },
            )
            .await,
        Err(EngineError::SlotConflict { .. })
    ));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let shop = Shop::open("compaction.wal").await;
    let a = shop.book(shop.haircut, at(9, 0)).await.unwrap();
    for minute in [5, 10, 15, 20] {
        shop.engine.reschedule(shop.tenant, a.id, at(9, minute)).await.unwrap();
    }
    let before = shop.engine.wal_appends_since_compact().await;
    assert!(before >= 9);

    // Tenant, client, two services, one appointment.
    assert_eq!(shop.engine.compact_wal().await.unwrap(), 5);
    assert_eq!(shop.engine.wal_appends_since_compact().await, 0);

    // Appends after compaction land in the new file.
    let b = shop.book(shop.haircut, at(11, 0)).await.unwrap();

    let path = test_wal_path_keep("compaction.wal");
    let reopened = Engine::new(path, Arc::new(NotifyHub::new()), SchedulingPolicy::default()).unwrap();
    let a_now = reopened.get_appointment(shop.tenant, a.id).await.unwrap();
    assert_eq!(a_now.span.start, at(9, 20));
    assert!(reopened.get_appointment(shop.tenant, b.id).await.is_ok());
}

fn test_wal_path_keep(name: &str) -> PathBuf {
    std::env::temp_dir().join("agenda_test_engine").join(name)
}
