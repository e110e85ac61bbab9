//! End-to-end scenarios named after the ones in the design documentation (S1-S6): coalescing,
//! mixed sleep/batch paths, per-index and whole-batch errors, `max_size`, and chaining.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use batchy::{
    batch_context, chain, immediate, pget, spawn, sleep, Batched, Error, ErrorKind, Raise,
};

#[test]
fn s1_coalescing() {
    let call_count = Rc::new(Cell::new(0));
    let call_count2 = call_count.clone();
    let seen_args = Rc::new(RefCell::new(Vec::new()));
    let seen_args2 = seen_args.clone();

    let fn_ = Batched::new(move |args: Vec<i32>| {
        call_count2.set(call_count2.get() + 1);
        seen_args2.borrow_mut().push(args.clone());
        async move { Ok(args.into_iter().map(Ok).collect()) }
    });

    let out = batch_context(async move {
        let a = fn_.clone();
        let b = fn_.clone();
        let x = spawn(async move { a.call(1).await });
        let y = spawn(async move { b.call(2).await });
        pget([x, y]).await
    })
    .unwrap();

    assert_eq!(call_count.get(), 1);
    assert_eq!(seen_args.borrow().as_slice(), &[vec![1, 2]]);
    assert_eq!(out, vec![1, 2]);
}

#[test]
fn s2_mixed_sleep_and_batch_paths_fire_two_batches() {
    let call_count = Rc::new(Cell::new(0));
    let call_count2 = call_count.clone();

    let fn_ = Batched::new(move |args: Vec<i32>| {
        call_count2.set(call_count2.get() + 1);
        async move { Ok(args.into_iter().map(Ok).collect::<Vec<_>>()) }
    });

    batch_context(async move {
        let a = fn_.clone();
        let b = fn_.clone();
        let get_a = spawn(async move {
            a.call(1).await?;
            a.call(2).await
        });
        let get_b = spawn(async move {
            b.call(2).await?;
            sleep(Duration::from_micros(100)).await;
            b.call(1).await
        });
        pget([get_a, get_b]).await
    })
    .unwrap();

    assert_eq!(call_count.get(), 2);
}

#[test]
fn s3_per_index_error() {
    let fn_: Rc<Batched<i32, i32>> = Batched::new(|args: Vec<i32>| async move {
        Ok(args
            .into_iter()
            .map(|a| {
                if a % 2 == 0 {
                    Ok(a)
                } else {
                    Err(Raise(Error::user(std::io::Error::other("odd input"))))
                }
            })
            .collect())
    });

    let (first, second) = batch_context(async move {
        let a = fn_.clone();
        let b = fn_.clone();
        let first = spawn(async move { a.call(1).await });
        let second = spawn(async move { b.call(2).await });
        Ok::<_, Error>((first.get(None).await, second.get(None).await))
    })
    .unwrap();

    assert!(first.is_err());
    assert_eq!(second.unwrap(), 2);
}

#[test]
fn s4_whole_batch_error() {
    let fn_: Rc<Batched<i32, i32>> = Batched::new(|_args: Vec<i32>| async move {
        Err(Error::user(std::io::Error::other("backend unavailable")))
    });

    let result = batch_context(async move {
        let a = fn_.clone();
        let b = fn_.clone();
        let first = spawn(async move { a.call(1).await });
        let second = spawn(async move { b.call(2).await });
        let (r1, r2) = (first.get(None).await, second.get(None).await);
        assert!(r1.is_err());
        assert!(r2.is_err());
        Ok::<_, Error>(())
    });

    assert!(result.is_ok());
}

#[test]
fn s5_max_size_forces_immediate_fire_per_call() {
    let call_count = Rc::new(Cell::new(0));
    let call_count2 = call_count.clone();

    let fn_ = Batched::with_max_size(
        move |args: Vec<i32>| {
            call_count2.set(call_count2.get() + 1);
            async move { Ok(args.into_iter().map(Ok).collect::<Vec<_>>()) }
        },
        Some(1),
    );

    batch_context(async move {
        let a = fn_.clone();
        let b = fn_.clone();
        let first = spawn(async move { a.call(1).await });
        let second = spawn(async move { b.call(2).await });
        pget([first, second]).await
    })
    .unwrap();

    assert_eq!(call_count.get(), 2);
}

#[test]
fn s6_chaining() {
    let out = batch_context(async move {
        let chained = chain(immediate(2), |v| async move {
            spawn(async move { Ok(v * 4) }).get(None).await
        });
        assert!(!chained.ready());
        chained.get(None).await
    })
    .unwrap();

    assert_eq!(out, 8);
}

#[test]
fn get_timeout_does_not_affect_other_awaiters() {
    let fn_: Rc<Batched<i32, i32>> = Batched::new(|args: Vec<i32>| async move {
        sleep_then_echo(args).await
    });

    let (timed_out, ok) = batch_context(async move {
        let a = fn_.clone();
        let b = fn_.clone();
        let slow = spawn(async move { a.call(1).await });
        let fast_ready = spawn(async move { b.call(2).await });
        let timed_out = slow.get(Some(Duration::from_nanos(1))).await;
        let ok = fast_ready.get(None).await;
        Ok::<_, Error>((timed_out, ok))
    })
    .unwrap();

    assert_eq!(timed_out.unwrap_err().kind(), ErrorKind::Timeout);
    assert_eq!(ok.unwrap(), 2);
}

async fn sleep_then_echo(args: Vec<i32>) -> Result<Vec<batchy::OneResult<i32>>, Error> {
    sleep(Duration::from_millis(5)).await;
    Ok(args.into_iter().map(Ok).collect())
}
