use std::{env, error::Error};

use log::info;
use rmalloc::{ArenaHeap, Heap, HeapConfig, HeapGrower, SbrkHeap};

/// Replays the classic malloc-lab scenario and dumps the heap after every
/// step. Pass `--sbrk` to run on the real program break instead of a
/// simulated arena.
fn main() -> Result<(), Box<dyn Error>> {
  pretty_env_logger::formatted_builder()
    .parse_filters(&env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_owned()))
    .init();

  let config = HeapConfig::from_env();

  if env::args().any(|arg| arg == "--sbrk") {
    run(Heap::new(SbrkHeap::new(), config))
  } else {
    run(Heap::new(ArenaHeap::new(), config))
  }
}

fn run<G: HeapGrower>(mut heap: Heap<G>) -> Result<(), Box<dyn Error>> {
  heap.init()?;
  info!("[0] initial heap\n{}", heap);

  // --------------------------------------------------------------------
  // 1) Allocate 16 bytes: nothing fits yet, so the heap grows.
  // --------------------------------------------------------------------
  let first = heap.allocate(16)?;
  unsafe { first.as_ptr().write_bytes(0xAB, 16) };
  info!("[1] allocate(16) = {:p}\n{}", first, heap);

  // --------------------------------------------------------------------
  // 2) Free it: the block turns free and is merged with free neighbours.
  // --------------------------------------------------------------------
  unsafe { heap.free(first) };
  info!("[2] free({:p})\n{}", first, heap);

  // --------------------------------------------------------------------
  // 3) Allocate 8 bytes: first fit takes the freed spot.
  // --------------------------------------------------------------------
  let second = heap.allocate(8)?;
  info!(
    "[3] allocate(8) = {:p}, reused freed block: {}\n{}",
    second,
    second == first,
    heap
  );

  // --------------------------------------------------------------------
  // 4) Allocate 8 more bytes: the spot is taken, the heap grows again.
  // --------------------------------------------------------------------
  let third = heap.allocate(8)?;
  info!(
    "[4] allocate(8) = {:p}, heap is now {} bytes\n{}",
    third,
    heap.grower().size(),
    heap
  );

  // --------------------------------------------------------------------
  // 5) Free the tail and resize the first block into it without copying.
  // --------------------------------------------------------------------
  unsafe { heap.free(third) };
  let resized = unsafe { heap.resize(Some(second), 24)? };
  info!(
    "[5] resize({:p}, 24) = {:?}, moved: {}\n{}",
    second,
    resized,
    resized != Some(second),
    heap
  );

  let stats = heap.check()?;
  info!("[6] {:?}", stats);

  Ok(())
}
