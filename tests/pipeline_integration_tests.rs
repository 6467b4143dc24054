//! End-to-end tests of the rendering pipeline over the software driver.

use rstest::rstest;

use kaiga::geom::Rect;
use kaiga::graphics::{
    Context, DrawImageOptions, Geom, ImageOptions, Image, SharedContext, SoftwareGraphics,
};
use kaiga::{CompositeMode, GraphicsConfig};

fn context() -> Context<SoftwareGraphics> {
    Context::new(&GraphicsConfig::standard(), SoftwareGraphics::new(), 64, 64).unwrap()
}

fn solid(n: usize, px: [u8; 4]) -> Vec<u8> {
    px.iter().copied().cycle().take(n * 4).collect()
}

fn full_upload(ctx: &mut Context<SoftwareGraphics>, img: &Image, px: [u8; 4]) {
    let rect = Rect::new(0, 0, img.width(), img.height());
    let bytes = solid((rect.area()) as usize, px);
    ctx.replace_pixels(img, rect, &bytes).unwrap();
}

#[test]
fn fifty_compatible_draws_reach_the_driver_as_one_call() {
    let mut ctx = context();
    let src = ctx.new_image(16, 16, ImageOptions::default()).unwrap();
    let dst = ctx
        .new_image(
            256,
            256,
            ImageOptions {
                unmanaged: true,
                ..Default::default()
            },
        )
        .unwrap();
    full_upload(&mut ctx, &src, [10, 10, 10, 255]);
    ctx.end_frame().unwrap();

    ctx.driver_mut().reset_stats();
    ctx.begin_frame().unwrap();
    for i in 0..50 {
        ctx.draw_image(
            &dst,
            &src,
            &DrawImageOptions {
                geom: Geom::IDENTITY.translate((i % 16) as f32 * 16.0, (i / 16) as f32 * 16.0),
                ..Default::default()
            },
        )
        .unwrap();
    }
    ctx.end_frame().unwrap();

    let stats = ctx.driver_mut().stats();
    assert_eq!(stats.set_vertices_calls, 1);
    assert_eq!(stats.draw_calls, 1);
    assert_eq!(stats.last_index_len, 300);
}

#[test]
fn batched_and_flushed_rendering_agree_pixel_for_pixel() {
    let render = |flush_each: bool| {
        let mut ctx = context();
        let src = ctx.new_image(16, 16, ImageOptions::default()).unwrap();
        let dst = ctx
            .new_image(
                64,
                64,
                ImageOptions {
                    unmanaged: true,
                    ..Default::default()
                },
            )
            .unwrap();
        full_upload(&mut ctx, &src, [40, 0, 0, 40]);
        ctx.begin_frame().unwrap();
        for i in 0..4 {
            ctx.draw_image(
                &dst,
                &src,
                &DrawImageOptions {
                    geom: Geom::IDENTITY.translate(i as f32 * 10.0, i as f32 * 10.0),
                    mode: CompositeMode::Lighter,
                    ..Default::default()
                },
            )
            .unwrap();
            if flush_each {
                ctx.end_frame().unwrap();
                ctx.begin_frame().unwrap();
            }
        }
        ctx.end_frame().unwrap();
        let mut out = Vec::new();
        for y in 0..64 {
            for x in 0..64 {
                out.push(ctx.at(&dst, x, y).unwrap());
            }
        }
        out
    };
    assert_eq!(render(true), render(false));
}

#[rstest]
#[case(CompositeMode::SourceOver, [100, 61, 0, 161])]
#[case(CompositeMode::Clear, [0, 0, 0, 0])]
#[case(CompositeMode::Copy, [100, 0, 0, 100])]
#[case(CompositeMode::Destination, [0, 100, 0, 100])]
#[case(CompositeMode::SourceIn, [39, 0, 0, 39])]
#[case(CompositeMode::DestinationIn, [0, 39, 0, 39])]
#[case(CompositeMode::Xor, [61, 61, 0, 122])]
#[case(CompositeMode::Lighter, [100, 100, 0, 200])]
fn composite_modes_follow_the_factor_table(
    #[case] mode: CompositeMode,
    #[case] expected: [u8; 4],
) {
    let mut ctx = context();
    let src = ctx.new_image(1, 1, ImageOptions::default()).unwrap();
    let dst = ctx
        .new_image(
            1,
            1,
            ImageOptions {
                unmanaged: true,
                ..Default::default()
            },
        )
        .unwrap();
    full_upload(&mut ctx, &src, [100, 0, 0, 100]);
    full_upload(&mut ctx, &dst, [0, 100, 0, 100]);
    ctx.draw_image(
        &dst,
        &src,
        &DrawImageOptions {
            mode,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(ctx.at(&dst, 0, 0).unwrap(), expected);
}

#[test]
fn context_loss_replays_the_frame() {
    let mut ctx = context();
    let i = ctx.new_image(4, 4, ImageOptions::default()).unwrap();
    let j = ctx.new_image(4, 4, ImageOptions::default()).unwrap();
    full_upload(&mut ctx, &i, [255, 0, 0, 255]);
    ctx.begin_frame().unwrap();
    ctx.draw_image(&j, &i, &DrawImageOptions::default()).unwrap();
    ctx.driver_mut().invalidate_context();
    ctx.end_frame().unwrap();
    for y in 0..4 {
        for x in 0..4 {
            assert_eq!(ctx.at(&j, x, y).unwrap(), [255, 0, 0, 255]);
        }
    }
}

#[test]
fn repeated_context_loss_is_idempotent() {
    let mut ctx = context();
    let i = ctx.new_image(4, 4, ImageOptions::default()).unwrap();
    let j = ctx.new_image(4, 4, ImageOptions::default()).unwrap();
    full_upload(&mut ctx, &i, [0, 200, 0, 255]);
    ctx.begin_frame().unwrap();
    ctx.draw_image(&j, &i, &DrawImageOptions::default()).unwrap();
    ctx.end_frame().unwrap();
    let before = ctx.at(&j, 2, 2).unwrap();

    for _ in 0..3 {
        ctx.driver_mut().invalidate_context();
        ctx.begin_frame().unwrap();
        ctx.end_frame().unwrap();
        assert_eq!(ctx.at(&j, 2, 2).unwrap(), before);
    }
}

#[test]
fn context_loss_with_nothing_queued_heals_on_readback() {
    let mut ctx = context();
    let i = ctx.new_image(4, 4, ImageOptions::default()).unwrap();
    full_upload(&mut ctx, &i, [30, 0, 30, 255]);
    ctx.end_frame().unwrap();
    // Nothing pending, so the next flush has no work to surface the
    // loss through; the readback path has to detect and restore.
    ctx.driver_mut().invalidate_context();
    assert_eq!(ctx.at(&i, 3, 3).unwrap(), [30, 0, 30, 255]);
}

#[test]
fn sub_image_draws_only_its_region() {
    let mut ctx = context();
    let sheet = ctx.new_image(8, 8, ImageOptions::default()).unwrap();
    let dst = ctx
        .new_image(
            4,
            4,
            ImageOptions {
                unmanaged: true,
                ..Default::default()
            },
        )
        .unwrap();
    // Left half red, right half green.
    for y in 0..8 {
        ctx.replace_pixels(&sheet, Rect::new(0, y, 4, 1), &solid(4, [255, 0, 0, 255]))
            .unwrap();
        ctx.replace_pixels(&sheet, Rect::new(4, y, 4, 1), &solid(4, [0, 255, 0, 255]))
            .unwrap();
    }
    let right = ctx.sub_image(&sheet, Rect::new(4, 0, 4, 4));
    ctx.draw_image(&dst, &right, &DrawImageOptions::default())
        .unwrap();
    assert_eq!(ctx.at(&dst, 0, 0).unwrap(), [0, 255, 0, 255]);
    assert_eq!(ctx.at(&dst, 3, 3).unwrap(), [0, 255, 0, 255]);
}

#[test]
fn dump_writes_a_png_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.png");
    let mut ctx = context();
    let img = ctx.new_image(2, 2, ImageOptions::default()).unwrap();
    full_upload(&mut ctx, &img, [7, 8, 9, 255]);
    ctx.dump_image(&img, &path).unwrap();
    let back = image::open(&path).unwrap().to_rgba8();
    assert_eq!(back.dimensions(), (2, 2));
    assert_eq!(back.get_pixel(1, 1).0, [7, 8, 9, 255]);
}

#[cfg(not(feature = "singlethread"))]
#[test]
fn game_thread_records_while_coordinator_flushes() {
    use kaiga::threading::{main_thread, Thread, ThreadError};

    let shared = SharedContext::new(context());
    let (main, handle) = main_thread();

    let game = {
        let shared = shared.clone();
        let handle = handle.clone();
        Thread::spawn(Some("game"), move || {
            let (src, dst) = {
                let mut ctx = shared.lock();
                let src = ctx.new_image(4, 4, ImageOptions::default()).unwrap();
                let dst = ctx
                    .new_image(
                        4,
                        4,
                        ImageOptions {
                            unmanaged: true,
                            ..Default::default()
                        },
                    )
                    .unwrap();
                let bytes = solid(16, [9, 0, 9, 255]);
                ctx.replace_pixels(&src, Rect::new(0, 0, 4, 4), &bytes)
                    .unwrap();
                ctx.draw_image(&dst, &src, &DrawImageOptions::default())
                    .unwrap();
                (src, dst)
            };
            // The frame barrier runs on the coordinator thread.
            let px = {
                let shared = shared.clone();
                handle
                    .call(move || {
                        let mut ctx = shared.lock();
                        ctx.end_frame().unwrap();
                        ctx.at(&dst, 1, 1).unwrap()
                    })
                    .unwrap()
            };
            let _ = src;
            handle.terminate().unwrap();
            px
        })
        .unwrap()
    };

    assert!(matches!(main.run(), Err(ThreadError::Terminated)));
    assert_eq!(game.join().unwrap(), [9, 0, 9, 255]);
}
