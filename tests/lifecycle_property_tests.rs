//! Property-based tests for the service request state machine
//!
//! The transition table decides every status change a request goes through,
//! and the aggregate methods layer authorization and side conditions on top
//! of it. Bugs here let two mechanics hold the same request or revive a
//! cancelled one, so these tests drive both layers through arbitrary
//! sequences instead of hand-picked cases.

use garage_dispatch::{
    Actor,
    directory::{Garage, Vehicle},
    lifecycle::{RequestStatus, ServiceRequest, Transition},
    types::Location,
};
use proptest::prelude::*;

// These property tests cover:
//
// 1. The transition table only allows the documented edges
// 2. Terminal statuses are stable
// 3. A mechanic is assigned exactly while the status requires one
// 4. A rejected operation leaves the aggregate untouched
//
// Storage and notification delivery are covered by the scenario tests.

const LEGAL: [(RequestStatus, Transition, RequestStatus); 5] = [
    (RequestStatus::Pending, Transition::Accept, RequestStatus::Accepted),
    (RequestStatus::Accepted, Transition::Begin, RequestStatus::InProgress),
    (RequestStatus::Pending, Transition::Cancel, RequestStatus::Cancelled),
    (RequestStatus::Accepted, Transition::Cancel, RequestStatus::Cancelled),
    (RequestStatus::InProgress, Transition::Complete, RequestStatus::Completed),
];

fn status_strategy() -> impl Strategy<Value = RequestStatus> {
    prop::sample::select(RequestStatus::ALL.to_vec())
}

fn transition_strategy() -> impl Strategy<Value = Transition> {
    prop::sample::select(vec![
        Transition::Accept,
        Transition::Begin,
        Transition::Cancel,
        Transition::Complete,
    ])
}

/// One call a party could make against a request.
#[derive(Debug, Clone)]
enum Step {
    Accept(&'static str),
    Begin(&'static str),
    Cancel(Actor),
    PostUpdate(&'static str),
    Complete(Actor),
}

/// Strategy to generate a step by one of the parties of garage g1, or by an
/// outsider.
fn step_strategy() -> impl Strategy<Value = Step> {
    let mechanic = prop::sample::select(vec!["m1", "m2", "m9"]);
    let canceller = prop::sample::select(vec![
        Actor::customer("c1"),
        Actor::customer("c2"),
        Actor::garage_admin("a1"),
        Actor::mechanic("m1"),
    ]);
    let completer = prop::sample::select(vec![
        Actor::mechanic("m1"),
        Actor::mechanic("m2"),
        Actor::garage_admin("a1"),
        Actor::customer("c1"),
    ]);

    prop_oneof![
        mechanic.clone().prop_map(Step::Accept),
        mechanic.clone().prop_map(Step::Begin),
        canceller.prop_map(Step::Cancel),
        mechanic.prop_map(Step::PostUpdate),
        completer.prop_map(Step::Complete),
    ]
}

fn fixture() -> (ServiceRequest, Garage) {
    let garage = Garage::new("g1", "Northside", "a1")
        .with_mechanic("m1")
        .with_mechanic("m2");
    let vehicle = Vehicle {
        id: "v1".into(),
        owner_id: "c1".into(),
        make: "Saab".into(),
        model: "900".into(),
        plate: "ABC-123".into(),
    };
    let request = ServiceRequest::open(
        &Actor::customer("c1"),
        &garage,
        &vehicle,
        Location::new(0.0, 0.0).unwrap(),
    )
    .unwrap()
    .value;
    (request, garage)
}

fn run(request: &mut ServiceRequest, garage: &Garage, step: &Step) -> bool {
    match step {
        Step::Accept(m) => request.accept(&Actor::mechanic(*m), garage).is_ok(),
        Step::Begin(m) => request.begin(&Actor::mechanic(*m), garage).is_ok(),
        Step::Cancel(actor) => request.cancel(actor, garage, None).is_ok(),
        Step::PostUpdate(m) => request
            .post_update(&Actor::mechanic(*m), garage, "checked tyres")
            .is_ok(),
        Step::Complete(actor) => request.complete(actor, garage).is_ok(),
    }
}

proptest! {
    /// Property: apply succeeds exactly on the legal edges and lands on
    /// the documented target
    #[test]
    fn prop_only_legal_edges(from in status_strategy(), transition in transition_strategy()) {
        let expected = LEGAL
            .iter()
            .find(|(f, t, _)| *f == from && *t == transition)
            .map(|(_, _, to)| *to);

        match from.apply(transition) {
            Ok(to) => {
                prop_assert_eq!(Some(to), expected, "{} {} should be rejected", from, transition);
            }
            Err(e) => {
                prop_assert!(expected.is_none(), "{} {} should be allowed", from, transition);
                prop_assert_eq!(e.code(), "conflict");
            }
        }
    }

    /// Property: nothing leaves a terminal status
    #[test]
    fn prop_terminal_states_are_stable(transition in transition_strategy()) {
        for from in RequestStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            prop_assert!(from.apply(transition).is_err());
        }
    }

    /// Property: after any sequence of calls the mechanic assignment matches
    /// the status and a rejected call changed nothing
    #[test]
    fn prop_sequences_keep_the_aggregate_consistent(
        steps in prop::collection::vec(step_strategy(), 0..24)
    ) {
        let (mut request, garage) = fixture();
        let mut claimed_by: Option<String> = None;

        for step in &steps {
            let before = request.clone();
            let ok = run(&mut request, &garage, step);

            if !ok {
                prop_assert_eq!(&request, &before, "rejected {:?} mutated the request", step);
            }
            prop_assert!(request.is_consistent(), "inconsistent after {:?}: {:?}", step, request);

            // once claimed, the request never changes hands
            if let Some(m) = &request.mechanic_id {
                match &claimed_by {
                    Some(owner) => {
                        prop_assert_eq!(owner, m);
                    }
                    None => claimed_by = Some(m.clone()),
                }
            }
            if before.status.is_terminal() {
                prop_assert_eq!(request.status, before.status);
            }
        }
    }
}
