//! Genericized threadpool.  This gets used to setup specialized pools
//! for various parallel work we want to do, like artifact transfers
//! and fingerprint checks.


// Most impl's will get put under here.

/// Artifact (fullfile/pack) transfers
pub(crate) mod fetch;

/// Fingerprint verification over an installed tree
pub(crate) mod fprint;


// Settings for parallelism level.  Really, this is config/command-line
// stuff, but quite often pool setup is a long way removed from having
// that, so we'll just stash up info globally.  Of course, Rust doesn't
// love that for mostly good reasons, but it seems like using atomics
// works, and we only need little numbers anyway, so...
use std::sync::atomic::{AtomicU32, Ordering};

/// How many transfers to keep in flight at once.
static JOBS_NET: AtomicU32 = AtomicU32::new(25);

/// How many threads to use on more CPU-bound tasks, like fingerprint
/// checking.  We also use this for filesystem-walking sort of things,
/// which are technically more IO bound, but...
static JOBS_CPU: AtomicU32 = AtomicU32::new(4);

/// Read the network job limit
pub(crate) fn jobs_net() -> u32 { JOBS_NET.load(Ordering::Relaxed) }
/// Read the CPU job limit
fn jobs_cpu() -> u32 { JOBS_CPU.load(Ordering::Relaxed) }


/// Initialize parallelism levels.  This is expected to just get called
/// once up-front.  If None is passed for either, they'll be initialized
/// with a default value.
///
/// The default for network parallelism is 25 in-flight transfers,
/// which the servers are sized to expect.  Reducing it may help if
/// you're limited on bandwidth.
///
/// The default for CPU parallelism is the number of CPU's, up to a
/// default max of 6.
pub(crate) fn init_jobs(net: &Option<u32>, cpu: &Option<u32>)
{
	let newnet = net.unwrap_or(fetch::MAX_XFER);
	let newcpu = match cpu {
		Some(c) => *c,
		None => {
			let def: std::num::NonZeroUsize = 1.try_into().unwrap();
			let def: Result<_, std::io::Error> = Ok(def);
			let mut ncpu = std::thread::available_parallelism().or(def)
					.unwrap().get().try_into().unwrap();
			if ncpu > 6 { ncpu = 6; }
			ncpu
		},
	};

	// Guard against somebody setting 0
	if newnet < 1 { panic!("{newnet} network transfers is insane."); }
	if newcpu < 1 { panic!("{newcpu} cpu threads is insane."); }

	JOBS_NET.store(newnet, Ordering::Relaxed);
	JOBS_CPU.store(newcpu, Ordering::Relaxed);
}




/// The overarching trait that implements pools.  Individual users
/// define the types for their particular work, fill in the
/// per-work-unit function, and get the thread and channel plumbing for
/// free.
pub(crate) trait Pool: Sized
{
	/// The finalized return.  This may be as simple as a
	/// Vec<Self::WorkResult>, but often will have some post-processing
	/// done by Self::finalize()
	type PoolResult;

	/// General data that will be needed for the pool in a particular
	/// instance; e.g., the transfer pool needs the HTTP agent and the
	/// cache paths.  Each worker gets its own copy via
	/// mk_unitcontrol().
	type Control;

	/// The per-worker copy of the control data.  In practice this has
	/// always been the same struct as Control, made by cloning.
	type UnitControl: Send;

	/// Make the per-worker control.
	fn mk_unitcontrol(ctrl: &Self::Control) -> Self::UnitControl;


	/// Each worker will receive an individual unit of work...
	type WorkRequest: Send + Sync + 'static;
	/// ...and process it into a result...
	type WorkResult: Send;
	/// ...or an error.
	type WorkErr: Send;

	/// Process one unit of work.
	fn work(ctrl: &Self::UnitControl, req: Self::WorkRequest)
			-> Result<Self::WorkResult, Self::WorkErr>;


	/// The result of each work unit may need processing as it comes
	/// in, to aggregate up into the impl'ing struct.  Called once per
	/// work() return, in completion order.
	fn work_result(&mut self, resp: Result<Self::WorkResult, Self::WorkErr>);


	/// Called after all the results have come in and the threads are
	/// spun down; crafts the Self::PoolResult that run() returns.
	fn finalize(self) -> Self::PoolResult;


	/// How many threads to spin off.  Individual pool impl's are
	/// recommended to wrap jobs_net() or jobs_cpu() as appropriate,
	/// unless they really know better.
	fn nthreads(&self) -> u32 { 4 }


	/// The main runner: spin up the threads, feed in all the work,
	/// collect the results.  An error return from here is only an
	/// error from the plumbing; individual worker failures travel
	/// through work_result() into the PoolResult.
	fn run(self, ctrl: &Self::Control, items: Vec<Self::WorkRequest>)
			-> Result<Self::PoolResult, anyhow::Error>
	{
		// No watermarks just means "feed it all up front"
		let high = items.len() + 1;
		self.run_bounded(ctrl, items, high, 0)
	}


	/// The bounded runner.  Submission runs ahead of completion by at
	/// most `high` items; when it catches that ceiling, we drain
	/// completions down to `low` before feeding more.  This keeps a
	/// big work list from piling onto the queue faster than the
	/// workers clear it, while still keeping the workers from ever
	/// going idle in between.
	fn run_bounded(mut self, ctrl: &Self::Control,
			items: Vec<Self::WorkRequest>, high: usize, low: usize)
			-> Result<Self::PoolResult, anyhow::Error>
	{
		// Spawn off a thread scope for all the fun details
		std::thread::scope(|s|
				-> Result<Self::PoolResult, anyhow::Error> {

			// Prep channels for passing requests and results around.
			use crossbeam::channel;
			let (req_snd, req_rcv) = channel::unbounded();
			let (res_snd, res_rcv) = channel::unbounded();

			// Spawn off the threadpool
			let nthr = self.nthreads();
			if nthr == 0 { panic!("nthreads {nthr} is insane"); }
			for _ in 1..=nthr
			{
				let uctrl = Self::mk_unitcontrol(&ctrl);
				let reqs = req_rcv.clone();
				let ress = res_snd.clone();
				s.spawn(move || {
					// Loop over requests until we run out
					while let Ok(req) = reqs.recv()
					{
						let res = Self::work(&uctrl, req);
						// Should be impossible for send to fail; that'd
						// only happen if the response channel were
						// closed
						ress.send(res)
								.expect("Response channel shouldn't be closed");
					}

					// Will fall off the end when the reqs channel is
					// closed, which means every piece of work has been
					// sent, and we've run out of stuff todo.
				});
			}

			// Only ref's to these channels should be down in the
			// workers now.
			drop(req_rcv);
			drop(res_snd);


			// Feed in the work, under the watermarks.
			let mut outstanding = 0usize;
			for i in items.into_iter()
			{
				req_snd.send(i)?;
				outstanding += 1;

				if outstanding >= high
				{
					// Hit the ceiling; drain down to the low mark
					// before submitting more.
					while outstanding > low
					{
						let resp = res_rcv.recv()?;
						self.work_result(resp);
						outstanding -= 1;
					}
				}
			}

			// Now we've sent all the work to do, so get rid of our
			// sending channel; that will let the workers all silently
			// fall out of their receive loops when there's nothing
			// left to do.
			drop(req_snd);


			// Collect the stragglers.
			while let Ok(resp) = res_rcv.recv()
			{
				self.work_result(resp);
			}

			// Call the finalizer, and that's what we give back.
			let ret = self.finalize();
			Ok(ret)
		})
	}
}
